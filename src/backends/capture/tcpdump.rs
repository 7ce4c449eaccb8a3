// tcpdump subprocess capture backend

use super::CaptureBackend;
use crate::capture::{CaptureFailure, CaptureShared, find_executable};
use crate::flows::{FlowAggregator, PacketEvent};
use crate::traffic_classifier::{Protocol, normalize_ip};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Capture via a long-running `tcpdump -nn -l -q -tt` subprocess
///
/// Only the first selected interface is captured; tcpdump cannot listen on
/// several named interfaces in one process.
pub struct TcpdumpBackend {
    program: String,
}

impl TcpdumpBackend {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn resolve(&self) -> Option<PathBuf> {
        find_executable(&self.program)
    }
}

impl CaptureBackend for TcpdumpBackend {
    fn name(&self) -> &'static str {
        "tcpdump"
    }

    fn is_available(&self) -> bool {
        self.resolve().is_some()
    }

    fn start(
        &self,
        interfaces: &[String],
        sink: Arc<FlowAggregator>,
        shared: Arc<CaptureShared>,
    ) -> Result<(), CaptureFailure> {
        let program = self.resolve().ok_or(CaptureFailure::ToolMissing("tcpdump"))?;
        let iface = interfaces
            .first()
            .filter(|iface| iface.as_str() != "any")
            .ok_or(CaptureFailure::NoInterface("tcpdump"))?;

        let mut child = Command::new(&program)
            .args(["-nn", "-l", "-q", "-tt", "-i", iface.as_str(), "ip or ip6"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                log::warn!("Failed to spawn {}: {}", program.display(), e);
                CaptureFailure::StartFailed("tcpdump")
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(CaptureFailure::StartFailed("tcpdump"));
        };

        log::info!("tcpdump capture started on {} (pid {:?})", iface, child.id());

        tokio::spawn(read_packets(stdout, sink));
        let diagnostics = tokio::spawn(first_diagnostic(stderr));

        tokio::spawn(async move {
            let status = child.wait().await;
            // stderr reaches EOF once the process is gone
            let diagnostic = diagnostics.await.ok().flatten();
            let reason = match (&status, diagnostic) {
                (_, Some(line)) => line,
                (Ok(status), None) => format!("tcpdump-exited ({})", status),
                (Err(_), None) => "tcpdump-exited".to_string(),
            };
            log::warn!("tcpdump exited: {}", reason);
            shared.mark_exited(reason);
        });

        Ok(())
    }
}

/// Feed every parseable stdout line into the aggregator
async fn read_packets<R: AsyncRead + Unpin>(stdout: R, sink: Arc<FlowAggregator>) {
    let mut lines = BufReader::new(stdout).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(raw)) => {
                let line = String::from_utf8_lossy(&raw);
                match parse_line(&line) {
                    Some(event) => {
                        sink.record(&event);
                    }
                    None => log::trace!("Skipping capture line: {}", line.trim_end()),
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("tcpdump stdout read error: {}", e);
                break;
            }
        }
    }
    log::debug!("tcpdump stdout closed");
}

/// First meaningful stderr line, read until EOF
async fn first_diagnostic<R: AsyncRead + Unpin>(stderr: R) -> Option<String> {
    let mut lines = BufReader::new(stderr).lines();
    let mut first = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let cleaned = line.trim();
        // banner lines are printed on every successful start
        if cleaned.is_empty()
            || cleaned.contains("verbose output suppressed")
            || cleaned.starts_with("listening on")
        {
            continue;
        }
        if first.is_none() {
            first = Some(cleaned.to_string());
        }
    }
    first
}

/// Parse one line of `tcpdump -nn -q -tt` output
///
/// Grammar: `[timestamp] IP|IP6 <src hostport> > <dst hostport>: <remainder>`.
/// Lines without an address pair or a positive length are rejected.
pub fn parse_line(line: &str) -> Option<PacketEvent> {
    let mut rest = line.trim();

    let (first, after) = rest.split_once(char::is_whitespace)?;
    if is_timestamp(first) {
        rest = after.trim_start();
    }

    let (family, after) = rest.split_once(char::is_whitespace)?;
    if family != "IP" && family != "IP6" {
        return None;
    }

    let (src, after) = after.trim_start().split_once(" > ")?;
    let (dst, remainder) = after.split_once(": ")?;

    let (src_addr, src_port) = split_host_port(src)?;
    let (dst_addr, dst_port) = split_host_port(dst)?;

    let length = parse_length(remainder)?;

    Some(PacketEvent {
        src_addr,
        src_port,
        dst_addr,
        dst_port,
        protocol: parse_protocol(remainder),
        length,
    })
}

fn is_timestamp(token: &str) -> bool {
    token.contains('.') && token.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ':')
}

/// Split tcpdump's `addr.port` form
///
/// tcpdump separates the port with a dot for both families
/// (`10.0.0.5.443`, `2001:db8::1.443`). A string that is already a valid
/// address (ICMP has no ports) gets port 0.
pub fn split_host_port(hostport: &str) -> Option<(IpAddr, u16)> {
    let trimmed = hostport.trim().trim_end_matches(':');
    if trimmed.is_empty() {
        return None;
    }
    if let Some(ip) = normalize_ip(trimmed) {
        return Some((ip, 0));
    }
    let (base, port) = trimmed.rsplit_once('.')?;
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((normalize_ip(base)?, port.parse().ok()?))
}

fn parse_protocol(remainder: &str) -> Protocol {
    let upper = remainder.to_ascii_uppercase();
    if upper.contains("UDP") {
        Protocol::Udp
    } else if upper.contains("ICMP") {
        Protocol::Icmp
    } else {
        Protocol::Tcp
    }
}

/// Payload length from `length N`, `len N` or quiet-mode `tcp N`
fn parse_length(remainder: &str) -> Option<u64> {
    let tokens: Vec<&str> = remainder
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();

    tokens
        .windows(2)
        .filter(|pair| matches!(pair[0], "length" | "len" | "tcp"))
        // keywords also appear as plain words, e.g. "tcp port 443 unreachable"
        .find_map(|pair| {
            pair[1]
                .trim_end_matches(':')
                .parse::<u64>()
                .ok()
                .filter(|len| *len > 0)
        })
}
