// Per-tick host counters: CPU, memory, network and disk I/O

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Networks, RefreshKind, System};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuSample {
    pub per_core: Vec<f32>,
    pub total: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used: u64,
    pub total: u64,
    pub percent: f64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub swap_percent: f64,
}

/// Cumulative interface byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// Cumulative block device counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
}

#[derive(Debug, Clone)]
pub struct SystemSample {
    pub cpu: CpuSample,
    pub memory: MemorySample,
    pub network: NetCounters,
    pub disk: DiskCounters,
}

/// Rates between two counter samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoRates {
    pub upload_mb_s: f64,
    pub download_mb_s: f64,
    pub read_mb_s: f64,
    pub write_mb_s: f64,
    pub read_iops: f64,
    pub write_iops: f64,
    /// Bytes sent plus received in the window
    pub network_bytes: u64,
}

const MIB: f64 = 1024.0 * 1024.0;

impl IoRates {
    /// Counter differences over `elapsed` seconds; a counter that went
    /// backwards counts as zero
    pub fn between(
        prev_net: &NetCounters,
        net: &NetCounters,
        prev_disk: &DiskCounters,
        disk: &DiskCounters,
        elapsed: f64,
    ) -> Self {
        let sent = net.bytes_sent.saturating_sub(prev_net.bytes_sent);
        let recv = net.bytes_recv.saturating_sub(prev_net.bytes_recv);
        let read = disk.read_bytes.saturating_sub(prev_disk.read_bytes);
        let written = disk.write_bytes.saturating_sub(prev_disk.write_bytes);
        Self {
            upload_mb_s: sent as f64 / elapsed / MIB,
            download_mb_s: recv as f64 / elapsed / MIB,
            read_mb_s: read as f64 / elapsed / MIB,
            write_mb_s: written as f64 / elapsed / MIB,
            read_iops: disk.read_count.saturating_sub(prev_disk.read_count) as f64 / elapsed,
            write_iops: disk.write_count.saturating_sub(prev_disk.write_count) as f64 / elapsed,
            network_bytes: sent + recv,
        }
    }
}

/// Owns the sysinfo handles for one session
///
/// Construction takes the baseline, so the first `sample` reports CPU usage
/// over the first tick rather than since boot.
pub struct SystemSampler {
    system: System,
    networks: Networks,
}

impl SystemSampler {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
        }
    }

    /// Blocking: reads /proc (or the platform equivalent)
    pub fn sample(&mut self) -> SystemSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh();

        let per_core: Vec<f32> = self.system.cpus().iter().map(|cpu| cpu.cpu_usage()).collect();
        let total = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().sum::<f32>() / per_core.len() as f32
        };

        let network = self
            .networks
            .iter()
            .fold(NetCounters::default(), |acc, (_, data)| NetCounters {
                bytes_sent: acc.bytes_sent + data.total_transmitted(),
                bytes_recv: acc.bytes_recv + data.total_received(),
            });

        SystemSample {
            cpu: CpuSample { per_core, total },
            memory: memory_sample(&self.system),
            network,
            disk: self.disk_counters(),
        }
    }

    /// Whole-disk counters from /proc/diskstats
    #[cfg(target_os = "linux")]
    fn disk_counters(&mut self) -> DiskCounters {
        let stats = match procfs::diskstats() {
            Ok(stats) => stats,
            Err(e) => {
                log::debug!("diskstats unavailable: {}", e);
                return DiskCounters::default();
            }
        };
        stats
            .into_iter()
            .filter(|disk| is_whole_disk(&disk.name))
            .fold(DiskCounters::default(), |acc, disk| DiskCounters {
                // diskstats sectors are always 512 bytes
                read_bytes: acc.read_bytes + disk.sectors_read * 512,
                write_bytes: acc.write_bytes + disk.sectors_written * 512,
                read_count: acc.read_count + disk.reads,
                write_count: acc.write_count + disk.writes,
            })
    }

    /// Summed per-process I/O; operation counts are not exposed
    #[cfg(not(target_os = "linux"))]
    fn disk_counters(&mut self) -> DiskCounters {
        use sysinfo::ProcessRefreshKind;

        self.system.refresh_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_disk_usage()),
        );
        self.system
            .processes()
            .values()
            .fold(DiskCounters::default(), |acc, process| {
                let usage = process.disk_usage();
                DiskCounters {
                    read_bytes: acc.read_bytes + usage.total_read_bytes,
                    write_bytes: acc.write_bytes + usage.total_written_bytes,
                    ..acc
                }
            })
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn memory_sample(system: &System) -> MemorySample {
    let used = system.used_memory();
    let total = system.total_memory();
    let swap_used = system.used_swap();
    let swap_total = system.total_swap();
    MemorySample {
        used,
        total,
        percent: percent(used, total),
        swap_used,
        swap_total,
        swap_percent: percent(swap_used, swap_total),
    }
}

pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Real block devices only; partitions, loop and ram devices would double
/// count or add noise
#[cfg(target_os = "linux")]
fn is_whole_disk(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return false;
    }
    std::path::Path::new("/sys/block").join(name).exists()
}
