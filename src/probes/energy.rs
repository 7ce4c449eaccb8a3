// Power draw probe

use super::Probe;
#[cfg(target_os = "macos")]
use super::command;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyReading {
    pub wattage: Option<f64>,
    pub source: &'static str,
}

/// Whole-system (or package) power draw in watts
///
/// macOS: powermetrics, falling back to pmset. Linux: RAPL energy
/// counters sampled one second apart, falling back to the battery's
/// reported power.
pub struct EnergyProbe;

impl Probe for EnergyProbe {
    type Output = EnergyReading;

    fn name(&self) -> &'static str {
        "energy"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// powermetrics fallbacks run one after another, each capped at 1.5 s
    #[cfg(target_os = "macos")]
    fn deadline(&self) -> Duration {
        Duration::from_secs(8)
    }

    async fn sample(&self) -> Option<EnergyReading> {
        read_wattage().await
    }
}

#[cfg(target_os = "macos")]
async fn read_wattage() -> Option<EnergyReading> {
    const DEADLINE: Duration = Duration::from_millis(1500);

    let realtime = command::run(
        "powermetrics",
        &["-n", "1", "-i", "1", "--samplers", "cpu_power"],
        DEADLINE,
    )
    .await;
    if let Some(mw) = realtime.as_deref().and_then(|out| command::number_after(out, "CPU Power:")) {
        return Some(EnergyReading {
            wattage: Some(mw / 1000.0),
            source: "powermetrics",
        });
    }

    let attempts: [&[&str]; 4] = [
        &["--samplers", "cpu_power", "-n", "1", "-i", "1000"],
        &["--samplers", "cpu_power,thermal", "-n", "1", "-i", "1000"],
        &["--samplers", "smc", "-n", "1", "-i", "1000"],
        &["-n", "1", "-i", "1000"],
    ];
    for args in attempts {
        if let Some(watts) = command::run("powermetrics", args, DEADLINE)
            .await
            .as_deref()
            .and_then(parse_watts)
        {
            return Some(EnergyReading {
                wattage: Some(watts),
                source: "powermetrics",
            });
        }
    }

    let pmset = command::run("pmset", &["-g", "batt"], DEADLINE).await?;
    Some(EnergyReading {
        wattage: parse_watts(&pmset),
        source: "pmset",
    })
}

#[cfg(target_os = "linux")]
async fn read_wattage() -> Option<EnergyReading> {
    if let Some(watts) = rapl::package_watts().await {
        return Some(EnergyReading {
            wattage: Some(watts),
            source: "rapl",
        });
    }
    let watts = tokio::task::spawn_blocking(power_supply_watts).await.ok()??;
    Some(EnergyReading {
        wattage: Some(watts),
        source: "power_supply",
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn read_wattage() -> Option<EnergyReading> {
    None
}

/// Total power from powermetrics/pmset text
///
/// A combined figure wins; otherwise the per-component figures are summed;
/// otherwise the first value with a watt unit is taken.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_watts(text: &str) -> Option<f64> {
    for label in ["Combined Power", "System Power", "Package Power"] {
        if let Some(watts) = labelled_watts(text, label) {
            return Some(watts);
        }
    }

    let components: Vec<f64> = ["CPU Power", "GPU Power", "ANE Power", "DRAM Power"]
        .iter()
        .filter_map(|label| labelled_watts(text, label))
        .collect();
    if !components.is_empty() {
        return Some(components.iter().sum());
    }

    text.lines().find_map(|line| {
        line.split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .find_map(|pair| unit_value(pair[0], pair[1]))
    })
}

fn labelled_watts(text: &str, label: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let (_, rest) = line.split_once(label)?;
        // skip "(CPU + GPU + ANE):" style qualifiers
        let rest = rest.rsplit_once(':').map(|(_, r)| r).unwrap_or(rest);
        let mut tokens = rest.split_whitespace();
        let value = tokens.next()?;
        let unit = tokens.next().unwrap_or("");
        unit_value(value, unit).or_else(|| {
            // "12.5W" with the unit attached
            value
                .strip_suffix("mW")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|mw| mw / 1000.0)
                .or_else(|| value.strip_suffix('W').and_then(|v| v.parse().ok()))
        })
    })
}

fn unit_value(value: &str, unit: &str) -> Option<f64> {
    let number: f64 = value.parse().ok()?;
    match unit.trim_end_matches([',', ';', ')']) {
        "W" => Some(number),
        "mW" => Some(number / 1000.0),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
mod rapl {
    use std::path::Path;
    use std::time::{Duration, Instant};

    const PACKAGE: &str = "/sys/class/powercap/intel-rapl:0";

    fn read_u64(path: &Path) -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Average package power over a one second window
    pub async fn package_watts() -> Option<f64> {
        let base = Path::new(PACKAGE);
        let counter = base.join("energy_uj");
        let first = read_u64(&counter)?;
        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = read_u64(&counter)?;
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);

        let consumed = if second >= first {
            second - first
        } else {
            // counter wrapped
            let range = read_u64(&base.join("max_energy_range_uj"))?;
            range.saturating_sub(first) + second
        };
        Some(consumed as f64 / 1_000_000.0 / elapsed)
    }
}

/// Discharge power reported by the first battery, in watts
#[cfg(target_os = "linux")]
fn power_supply_watts() -> Option<f64> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let read = |name: &str| -> Option<f64> {
            std::fs::read_to_string(path.join(name)).ok()?.trim().parse().ok()
        };
        let is_battery = std::fs::read_to_string(path.join("type"))
            .map(|kind| kind.trim() == "Battery")
            .unwrap_or(false);
        if !is_battery {
            continue;
        }
        if let Some(micro_watts) = read("power_now") {
            return Some(micro_watts / 1_000_000.0);
        }
        if let (Some(micro_amps), Some(micro_volts)) = (read("current_now"), read("voltage_now")) {
            return Some(micro_amps * micro_volts / 1e12);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_power_wins() {
        let text = "CPU Power: 900 mW\nGPU Power: 100 mW\nCombined Power (CPU + GPU + ANE): 1500 mW\n";
        assert_eq!(parse_watts(text), Some(1.5));
    }

    #[test]
    fn test_components_are_summed() {
        let text = "CPU Power: 2.5 W\nGPU Power: 0.5 W\nANE Power: 0 mW\n";
        assert_eq!(parse_watts(text), Some(3.0));
    }

    #[test]
    fn test_any_watt_value() {
        let text = "Now drawing from 'AC Power'\n -InternalBattery-0 (id=1234)\tAdapter 96 W, charging\n";
        assert_eq!(parse_watts(text), Some(96.0));
        assert_eq!(parse_watts("Now drawing from 'Battery Power'\n"), None);
    }
}
