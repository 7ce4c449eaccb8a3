// Linux procfs-based socket mapper

use super::{ConnectionRecord, SocketMapperBackend};
use crate::traffic_classifier::{Protocol, canonical};
use anyhow::Result;
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Socket mapper using Linux /proc filesystem
///
/// This backend reads socket information from:
/// - /proc/[pid]/fd/ - for socket inodes
/// - /proc/net/tcp, /proc/net/tcp6 - for TCP connections
/// - /proc/net/udp, /proc/net/udp6 - for UDP connections
pub struct ProcfsSocketMapper;

impl ProcfsSocketMapper {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    /// Socket inode -> process name, by scanning every process's fd table
    fn socket_owners() -> Result<HashMap<u64, String>> {
        let mut owners = HashMap::new();

        for process in all_processes()?.flatten() {
            // Permission failures and processes exiting mid-scan are skipped;
            // their sockets resolve to "unknown"
            let Ok(stat) = process.stat() else {
                continue;
            };
            let Ok(fds) = process.fd() else {
                continue;
            };
            for fd_info in fds.flatten() {
                if let FDTarget::Socket(inode) = fd_info.target {
                    owners.insert(inode, stat.comm.clone());
                }
            }
        }

        Ok(owners)
    }
}

fn record(
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
    inode: u64,
    owners: &HashMap<u64, String>,
) -> ConnectionRecord {
    ConnectionRecord {
        protocol,
        local_addr: canonical(local.ip()),
        local_port: local.port(),
        remote_addr: canonical(remote.ip()),
        remote_port: remote.port(),
        process_name: owners
            .get(&inode)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

impl SocketMapperBackend for ProcfsSocketMapper {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn connections(&self) -> Result<Vec<ConnectionRecord>> {
        let owners = Self::socket_owners()?;
        let mut records = Vec::new();

        for entries in [procfs::net::tcp(), procfs::net::tcp6()] {
            if let Ok(entries) = entries {
                records.extend(entries.into_iter().map(|entry| {
                    record(
                        Protocol::Tcp,
                        entry.local_address,
                        entry.remote_address,
                        entry.inode,
                        &owners,
                    )
                }));
            }
        }

        for entries in [procfs::net::udp(), procfs::net::udp6()] {
            if let Ok(entries) = entries {
                records.extend(entries.into_iter().map(|entry| {
                    record(
                        Protocol::Udp,
                        entry.local_address,
                        entry.remote_address,
                        entry.inode,
                        &owners,
                    )
                }));
            }
        }

        records.retain(ConnectionRecord::is_connected);
        Ok(records)
    }
}
