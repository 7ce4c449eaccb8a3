// CPU temperature and thermal pressure probe

use super::Probe;
#[cfg(target_os = "macos")]
use super::command;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ThermalReading {
    pub cpu_temp_c: Option<f64>,
    pub pressure_level: Option<String>,
    pub source: Option<&'static str>,
    /// Only a pressure level was available
    pub is_estimated: bool,
}

pub struct ThermalProbe;

impl Probe for ThermalProbe {
    type Output = ThermalReading;

    fn name(&self) -> &'static str {
        "thermal"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// powermetrics fallbacks run one after another, each capped at 1.5 s
    #[cfg(target_os = "macos")]
    fn deadline(&self) -> Duration {
        Duration::from_secs(8)
    }

    async fn sample(&self) -> Option<ThermalReading> {
        read_thermal().await
    }
}

/// Representative temperature for a thermal pressure level
pub fn pressure_base_temperature(level: Option<&str>) -> f64 {
    match level.map(str::to_ascii_lowercase).as_deref() {
        Some("moderate") => 65.0,
        Some("heavy") => 80.0,
        Some("serious") => 85.0,
        Some("critical") | Some("urgent") => 95.0,
        _ => 45.0,
    }
}

/// Temperature estimate from pressure level and current CPU load
pub fn estimate_cpu_temperature(level: Option<&str>, cpu_total: f64) -> f64 {
    let load = cpu_total.clamp(0.0, 100.0) / 100.0;
    (pressure_base_temperature(level) + load * 20.0).clamp(30.0, 100.0)
}

#[cfg(target_os = "macos")]
async fn read_thermal() -> Option<ThermalReading> {
    const DEADLINE: Duration = Duration::from_millis(1500);

    let attempts: [&[&str]; 4] = [
        &["--samplers", "thermal", "-n", "1", "-i", "1000"],
        &["--samplers", "thermal", "-n", "1", "-i", "1"],
        &["--samplers", "smc", "-n", "1", "-i", "1000"],
        &["-n", "1", "-i", "1000"],
    ];
    for args in attempts {
        let Some(output) = command::run("powermetrics", args, DEADLINE).await else {
            continue;
        };
        if let Some(reading) = parse_powermetrics(&output) {
            return Some(reading);
        }
    }
    None
}

#[cfg(not(target_os = "macos"))]
async fn read_thermal() -> Option<ThermalReading> {
    let temp = tokio::task::spawn_blocking(component_temperature).await.ok()??;
    Some(ThermalReading {
        cpu_temp_c: Some(temp),
        pressure_level: None,
        source: Some("sysinfo"),
        is_estimated: false,
    })
}

/// Hottest CPU-ish sensor, or the hottest sensor overall
#[cfg(not(target_os = "macos"))]
fn component_temperature() -> Option<f64> {
    let components = sysinfo::Components::new_with_refreshed_list();
    let readings: Vec<(String, f32)> = components
        .iter()
        .map(|c| (c.label().to_ascii_lowercase(), c.temperature()))
        .filter(|(_, t)| t.is_finite() && *t > 0.0)
        .collect();

    let is_cpu = |label: &str| {
        ["cpu", "package", "core", "tctl", "tdie", "k10temp", "coretemp"]
            .iter()
            .any(|hint| label.contains(hint))
    };
    let hottest = |only_cpu: bool| {
        readings
            .iter()
            .filter(|(label, _)| !only_cpu || is_cpu(label))
            .map(|(_, t)| *t)
            .fold(None, |max: Option<f32>, t| Some(max.map_or(t, |m| m.max(t))))
    };
    hottest(true).or_else(|| hottest(false)).map(f64::from)
}

/// Temperature and pressure from powermetrics text
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_powermetrics(text: &str) -> Option<ThermalReading> {
    let temp = parse_temperature(text);
    let pressure = parse_pressure_level(text);
    match (temp, pressure) {
        (Some(temp), pressure) => Some(ThermalReading {
            cpu_temp_c: Some(temp),
            pressure_level: pressure,
            source: Some("powermetrics"),
            is_estimated: false,
        }),
        (None, Some(pressure)) => Some(ThermalReading {
            cpu_temp_c: Some(pressure_base_temperature(Some(&pressure))),
            pressure_level: Some(pressure),
            source: Some("powermetrics"),
            is_estimated: true,
        }),
        (None, None) => None,
    }
}

fn parse_temperature(text: &str) -> Option<f64> {
    let lower = text.to_ascii_lowercase();
    for label in [
        "cpu die temperature:",
        "cpu temperature:",
        "soc die temperature:",
        "die temperature:",
    ] {
        if let Some(temp) = lower.lines().find_map(|line| celsius_after(line, label)) {
            return Some(temp);
        }
    }
    // any other "CPU ... temperature ... N C" line
    lower.lines().find_map(|line| {
        let start = line.find("cpu")?;
        let rest = &line[start..];
        let at = rest.find("temperature")?;
        let tail = &rest[at + "temperature".len()..];
        tail.split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .find(|token| !token.is_empty() && token.chars().any(|c| c.is_ascii_digit()))
            .and_then(|token| token.parse().ok())
    })
}

fn celsius_after(line: &str, label: &str) -> Option<f64> {
    let (_, rest) = line.split_once(label)?;
    let rest = rest.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value: f64 = rest[..end].parse().ok()?;
    rest[end..].trim_start().starts_with('c').then_some(value)
}

fn parse_pressure_level(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let at = lower.find("current pressure level:")?;
        let rest = line[at + "current pressure level:".len()..].trim_start();
        let level: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
        (!level.is_empty()).then_some(level)
    })
}
