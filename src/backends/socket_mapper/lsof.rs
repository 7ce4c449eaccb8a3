// macOS lsof-based socket mapper

use super::{ConnectionRecord, SocketMapperBackend, output_with_deadline};
use crate::traffic_classifier::{Protocol, normalize_ip};
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::process::Command;
use std::time::Duration;

/// lsof can stall on unreachable network mounts
const LSOF_DEADLINE: Duration = Duration::from_secs(3);

/// Socket mapper using lsof command
///
/// This backend executes `lsof -i -n -P -F pcPn` and parses the field
/// output into connection records.
pub struct LsofSocketMapper;

impl LsofSocketMapper {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("lsof command not found");
        }
        Ok(Self)
    }

    /// Parse lsof -F output format
    ///
    /// Format:
    /// p1234        <- PID
    /// cFirefox     <- Command name
    /// PTCP         <- Protocol
    /// n127.0.0.1:8080->93.184.216.34:80  <- Network connection
    pub(crate) fn parse_lsof_output(output: &str) -> Vec<ConnectionRecord> {
        let mut records = Vec::new();
        let mut current_name: Option<String> = None;
        let mut current_protocol: Option<Protocol> = None;

        for line in output.lines() {
            if line.is_empty() {
                continue;
            }

            let (marker, value) = line.split_at(1);

            match marker {
                "p" => {
                    current_name = None;
                    current_protocol = None;
                }
                "c" => current_name = Some(value.to_string()),
                "P" => {
                    current_protocol = match value {
                        "TCP" => Some(Protocol::Tcp),
                        "UDP" => Some(Protocol::Udp),
                        _ => None,
                    }
                }
                "n" => {
                    let Some(protocol) = current_protocol else {
                        continue;
                    };
                    let name = current_name
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string());
                    if let Some(record) = Self::parse_connection(value, protocol, name) {
                        records.push(record);
                    }
                }
                _ => {
                    // Ignore other markers (f for file descriptor, etc.)
                }
            }
        }

        records
    }

    /// Parse connection string from lsof
    ///
    /// Only connected sockets ("local->remote") produce a record:
    /// - "127.0.0.1:8080->93.184.216.34:80"
    /// - "[::1]:8080->[::1]:54321"
    fn parse_connection(
        conn_str: &str,
        protocol: Protocol,
        process_name: String,
    ) -> Option<ConnectionRecord> {
        let (local, remote) = conn_str.split_once("->")?;
        let (local_addr, local_port) = Self::parse_address(local)?;
        // lsof may append a state, e.g. "1.2.3.4:443 (ESTABLISHED)"
        let remote = remote.split_whitespace().next()?;
        let (remote_addr, remote_port) = Self::parse_address(remote)?;

        let record = ConnectionRecord {
            protocol,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            process_name,
        };
        record.is_connected().then_some(record)
    }

    /// Parse "addr:port" or "[v6addr]:port"
    fn parse_address(addr_str: &str) -> Option<(IpAddr, u16)> {
        let (ip_str, port_str) = addr_str.rsplit_once(':')?;
        let port = port_str.parse().ok()?;
        let ip = normalize_ip(ip_str)?;
        Some((ip, port))
    }
}

impl SocketMapperBackend for LsofSocketMapper {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn is_available() -> bool {
        crate::capture::find_executable("lsof").is_some()
    }

    fn connections(&self) -> Result<Vec<ConnectionRecord>> {
        // -i: Internet connections only
        // -n / -P: don't resolve hosts or ports
        // -F pcPn: pid, command, protocol, network address
        let output = output_with_deadline(
            Command::new("lsof").args(["-i", "-n", "-P", "-F", "pcPn"]),
            LSOF_DEADLINE,
        )
        .context("Failed to execute lsof command")?;

        // lsof exits 1 when some entries could not be read; the output is still usable
        if output.stdout.is_empty() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("lsof command failed: {}", stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Self::parse_lsof_output(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_output() {
        let output = "p412\ncSafari\nf23\nPTCP\nn10.0.0.5:54321->93.184.216.34:443\n\
                      f24\nPUDP\nn*:5353\np99\ncmDNSResponder\nf7\nPUDP\n\
                      n[fe80::1]:5353->[2001:4860:4860::8888]:53\n";
        let records = LsofSocketMapper::parse_lsof_output(output);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].process_name, "Safari");
        assert_eq!(records[0].protocol, Protocol::Tcp);
        assert_eq!(records[0].local_port, 54321);
        assert_eq!(records[0].remote_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(records[1].process_name, "mDNSResponder");
        assert_eq!(records[1].protocol, Protocol::Udp);
        assert_eq!(records[1].remote_port, 53);
    }
}
