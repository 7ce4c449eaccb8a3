// Top CPU consumers probe

use super::Probe;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

pub const TOP_PROCESS_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
}

/// Processes ranked by CPU usage since the previous sample
///
/// The `System` is kept between samples so that CPU usage is measured over
/// the probe interval; it is created (and baselined) with the session.
pub struct ProcessProbe {
    system: Arc<Mutex<System>>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_specifics(process_refresh());
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn process_refresh() -> RefreshKind {
    RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu())
}

impl Probe for ProcessProbe {
    type Output = Vec<ProcessEntry>;

    fn name(&self) -> &'static str {
        "processes"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(2)
    }

    async fn sample(&self) -> Option<Vec<ProcessEntry>> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_specifics(process_refresh());
            let entries = system
                .processes()
                .iter()
                .map(|(pid, process)| ProcessEntry {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    cpu_percent: process.cpu_usage(),
                })
                .collect();
            top_processes(entries, TOP_PROCESS_LIMIT)
        })
        .await
        .ok()
    }
}

/// Highest CPU first, ties broken by pid
pub fn top_processes(mut entries: Vec<ProcessEntry>, limit: usize) -> Vec<ProcessEntry> {
    entries.retain(|e| e.cpu_percent.is_finite());
    entries.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then_with(|| a.pid.cmp(&b.pid))
    });
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, cpu: f32) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: format!("proc{}", pid),
            cpu_percent: cpu,
        }
    }

    #[test]
    fn test_top_processes_ranked_descending() {
        let entries = vec![
            entry(1, 0.5),
            entry(2, 40.0),
            entry(3, 12.0),
            entry(4, 150.0),
            entry(5, 0.0),
            entry(6, 12.0),
            entry(7, f32::NAN),
        ];
        let top = top_processes(entries, TOP_PROCESS_LIMIT);
        let pids: Vec<u32> = top.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![4, 2, 3, 6, 1]);
    }

    #[tokio::test]
    async fn test_sample_returns_at_most_five() {
        let probe = ProcessProbe::new();
        let top = probe.sample().await.unwrap();
        assert!(top.len() <= TOP_PROCESS_LIMIT);
    }
}
