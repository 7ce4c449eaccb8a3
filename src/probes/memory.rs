// Detailed memory accounting probe

use super::Probe;
#[cfg(target_os = "macos")]
use super::command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub used: u64,
    pub total: u64,
    pub source: &'static str,
}

/// Page-level memory accounting (vm_stat on macOS, /proc/meminfo on Linux)
pub struct MemoryProbe;

impl Probe for MemoryProbe {
    type Output = MemoryReading;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn sample(&self) -> Option<MemoryReading> {
        read_memory().await
    }
}

#[cfg(target_os = "macos")]
async fn read_memory() -> Option<MemoryReading> {
    let output = command::run("vm_stat", &[], Duration::from_secs(1)).await?;
    let (used, total) = parse_vm_stat(&output)?;
    Some(MemoryReading {
        used,
        total,
        source: "vm_stat",
    })
}

#[cfg(target_os = "linux")]
async fn read_memory() -> Option<MemoryReading> {
    use procfs::Current;

    let meminfo = tokio::task::spawn_blocking(procfs::Meminfo::current)
        .await
        .ok()?
        .ok()?;
    // older kernels lack MemAvailable
    let available = meminfo
        .mem_available
        .unwrap_or(meminfo.mem_free + meminfo.buffers + meminfo.cached);
    Some(MemoryReading {
        used: meminfo.mem_total.saturating_sub(available),
        total: meminfo.mem_total,
        source: "meminfo",
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
async fn read_memory() -> Option<MemoryReading> {
    None
}

/// Used and total bytes from `vm_stat` output
///
/// used = active + inactive + wired + compressed pages;
/// total = used + free + speculative pages.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_vm_stat(text: &str) -> Option<(u64, u64)> {
    let mut page_size = 4096u64;
    let mut pages = std::collections::HashMap::new();

    for line in text.lines() {
        if let Some((_, rest)) = line.split_once("page size of ") {
            if let Some(size) = rest.split_whitespace().next().and_then(|s| s.parse().ok()) {
                page_size = size;
            }
            continue;
        }
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        if let Ok(count) = value.trim().trim_end_matches('.').parse::<u64>() {
            pages.insert(key.trim(), count);
        }
    }

    let get = |key: &str| pages.get(key).copied().unwrap_or(0);
    let used = get("Pages active")
        + get("Pages inactive")
        + get("Pages wired down")
        + get("Pages occupied by compressor");
    let total = used + get("Pages free") + get("Pages speculative");
    if total == 0 {
        return None;
    }
    Some((used * page_size, total * page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_stat() {
        let text = "Mach Virtual Memory Statistics: (page size of 16384 bytes)\n\
                    Pages free:                               10.\n\
                    Pages active:                             20.\n\
                    Pages inactive:                           30.\n\
                    Pages speculative:                         5.\n\
                    Pages throttled:                           0.\n\
                    Pages wired down:                         15.\n\
                    Pages occupied by compressor:             25.\n";
        let (used, total) = parse_vm_stat(text).unwrap();
        assert_eq!(used, 90 * 16384);
        assert_eq!(total, 105 * 16384);
    }

    #[test]
    fn test_empty_vm_stat_is_unavailable() {
        assert_eq!(parse_vm_stat(""), None);
    }
}
