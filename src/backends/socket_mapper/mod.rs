// Cross-platform connection-to-process mapping backends
//
// Each backend enumerates the host's connected sockets and reports which
// process owns them:
// - Linux: procfs (/proc/net/tcp etc. + /proc/[pid]/fd socket inodes)
// - macOS: lsof

use crate::traffic_classifier::Protocol;
use anyhow::{Context, Result};
use std::io::Read;
use std::net::IpAddr;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One connected socket and its owning process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub process_name: String,
}

impl ConnectionRecord {
    /// Whether both endpoints are concrete (listening and unconnected
    /// sockets have a wildcard remote)
    pub fn is_connected(&self) -> bool {
        !self.remote_addr.is_unspecified()
            && self.remote_port != 0
            && !self.local_addr.is_unspecified()
    }
}

/// Socket enumeration backend trait
pub trait SocketMapperBackend: Send + Sync {
    /// Backend name (e.g., "procfs", "lsof")
    fn name(&self) -> &'static str;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Enumerate all connected sockets with the owning process name
    ///
    /// Processes that vanish or deny access mid-scan are reported as
    /// "unknown" rather than failing the whole enumeration.
    fn connections(&self) -> Result<Vec<ConnectionRecord>>;
}

#[cfg(target_os = "linux")]
mod procfs;
#[cfg(target_os = "linux")]
pub use self::procfs::ProcfsSocketMapper;

#[cfg(target_os = "macos")]
mod lsof;
#[cfg(target_os = "macos")]
pub use lsof::LsofSocketMapper;

/// Run a command to completion, killing it once `deadline` has passed
///
/// Output pipes are drained on helper threads so a chatty child never
/// blocks on a full pipe while we poll for its exit.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn output_with_deadline(command: &mut Command, deadline: Duration) -> Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn command")?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to wait for command")? {
            break status;
        }
        if started.elapsed() >= deadline {
            if let Err(e) = child.kill() {
                log::debug!("Failed to kill timed-out command: {}", e);
            }
            // reap it; the drain threads finish once the pipes close
            let _ = child.wait();
            anyhow::bail!("command timed out after {:?}", deadline);
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Select the socket mapper for this platform
pub fn select_socket_mapper() -> Result<Box<dyn SocketMapperBackend>> {
    #[cfg(target_os = "linux")]
    {
        if ProcfsSocketMapper::is_available() {
            return Ok(Box::new(ProcfsSocketMapper::new()?));
        }
    }

    #[cfg(target_os = "macos")]
    {
        if LsofSocketMapper::is_available() {
            return Ok(Box::new(LsofSocketMapper::new()?));
        }
    }

    Err(anyhow::anyhow!(
        "No socket mapper backend available on this platform"
    ))
}
