// Battery health probe

use super::Probe;
#[cfg(target_os = "macos")]
use super::command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub health_percent: Option<f64>,
    pub current_capacity: Option<u64>,
    pub design_capacity: Option<u64>,
}

impl BatteryReading {
    /// Health is full-charge capacity relative to design capacity
    pub fn from_capacities(current: Option<u64>, design: Option<u64>) -> Option<Self> {
        if current.is_none() && design.is_none() {
            return None;
        }
        let health_percent = match (current, design) {
            (Some(current), Some(design)) if current > 0 && design > 0 => {
                Some(current as f64 * 100.0 / design as f64)
            }
            _ => None,
        };
        Some(Self {
            health_percent,
            current_capacity: current,
            design_capacity: design,
        })
    }
}

pub struct BatteryProbe;

impl Probe for BatteryProbe {
    type Output = BatteryReading;

    fn name(&self) -> &'static str {
        "battery"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn sample(&self) -> Option<BatteryReading> {
        read_battery().await
    }
}

#[cfg(target_os = "macos")]
async fn read_battery() -> Option<BatteryReading> {
    let output = command::run(
        "ioreg",
        &["-r", "-c", "AppleSmartBattery"],
        Duration::from_millis(1500),
    )
    .await?;
    parse_ioreg(&output)
}

#[cfg(target_os = "linux")]
async fn read_battery() -> Option<BatteryReading> {
    tokio::task::spawn_blocking(read_power_supply).await.ok()?
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn read_battery() -> Option<BatteryReading> {
    None
}

/// First battery under /sys/class/power_supply
#[cfg(target_os = "linux")]
fn read_power_supply() -> Option<BatteryReading> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_battery = std::fs::read_to_string(path.join("type"))
            .map(|kind| kind.trim() == "Battery")
            .unwrap_or(false);
        if !is_battery {
            continue;
        }
        let read = |name: &str| -> Option<u64> {
            std::fs::read_to_string(path.join(name)).ok()?.trim().parse().ok()
        };
        // energy_* in µWh, charge_* in µAh depending on the driver
        let current = read("energy_full").or_else(|| read("charge_full"));
        let design = read("energy_full_design").or_else(|| read("charge_full_design"));
        if let Some(reading) = BatteryReading::from_capacities(current, design) {
            return Some(reading);
        }
    }
    None
}

/// Capacities from `ioreg -r -c AppleSmartBattery`
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_ioreg(text: &str) -> Option<BatteryReading> {
    let mut capacities = std::collections::HashMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once(" = ") else {
            continue;
        };
        let key = key.trim_matches('"');
        if !key.ends_with("Capacity") || !key.chars().all(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        if let Ok(value) = value.trim().parse::<u64>() {
            capacities.insert(key.to_string(), value);
        }
    }

    let get = |key: &str| capacities.get(key).copied().filter(|v| *v > 0);
    let current = get("AppleRawMaxCapacity")
        .or_else(|| get("MaxCapacity"))
        .or_else(|| get("NominalChargeCapacity"))
        .or_else(|| get("FullChargeCapacity"));
    BatteryReading::from_capacities(current, get("DesignCapacity"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ioreg_prefers_raw_max() {
        let text = r#"
+-o AppleSmartBattery  <class AppleSmartBattery>
    {
      "MaxCapacity" = 100
      "AppleRawMaxCapacity" = 4400
      "DesignCapacity" = 5000
      "CurrentCapacity" = 80
    }
"#;
        let reading = parse_ioreg(text).unwrap();
        assert_eq!(reading.current_capacity, Some(4400));
        assert_eq!(reading.design_capacity, Some(5000));
        assert_eq!(reading.health_percent, Some(88.0));
    }

    #[test]
    fn test_missing_design_has_no_health() {
        let reading = parse_ioreg("\"MaxCapacity\" = 4000\n").unwrap();
        assert_eq!(reading.health_percent, None);
        assert_eq!(reading.current_capacity, Some(4000));
        assert!(parse_ioreg("no battery here").is_none());
    }
}
