// Network latency and jitter probe

use super::{Probe, command};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReading {
    pub latency_ms: f64,
    pub jitter_ms: f64,
}

/// Three quiet pings to a fixed target
pub struct LatencyProbe {
    target: String,
}

impl LatencyProbe {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }
}

impl Probe for LatencyProbe {
    type Output = LatencyReading;

    fn name(&self) -> &'static str {
        "latency"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn sample(&self) -> Option<LatencyReading> {
        let output = command::run(
            "ping",
            &["-c", "3", "-q", self.target.as_str()],
            Duration::from_millis(3500),
        )
        .await?;
        parse_ping_summary(&output)
    }
}

/// Average and deviation from the `min/avg/max/stddev = a/b/c/d ms` line
///
/// Matches both the BSD (`round-trip`) and Linux (`rtt`) summaries.
pub(crate) fn parse_ping_summary(text: &str) -> Option<LatencyReading> {
    text.lines().find_map(|line| {
        let (label, values) = line.split_once(" = ")?;
        if !label.contains("min/avg/max") {
            return None;
        }
        let values = values.trim().trim_end_matches("ms").trim();
        let fields: Vec<f64> = values
            .split('/')
            .map(|v| v.trim().parse().ok())
            .collect::<Option<_>>()?;
        if fields.len() < 4 {
            return None;
        }
        Some(LatencyReading {
            latency_ms: fields[1],
            jitter_ms: fields[3],
        })
    })
}
