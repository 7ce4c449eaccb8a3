// Capture adapter - owns the single process-wide packet capture

use crate::backends::capture::{CaptureBackend, create_capture_backend};
use crate::flows::FlowAggregator;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Why capture is not running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFailure {
    /// Configured capture method is not a known backend
    Disabled,
    ToolMissing(&'static str),
    NoInterface(&'static str),
    StartFailed(&'static str),
    /// Capture ran and then stopped; carries the diagnostic
    Exited(String),
}

impl fmt::Display for CaptureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureFailure::Disabled => write!(f, "capture-disabled"),
            CaptureFailure::ToolMissing(backend) => write!(f, "{}-not-installed", backend),
            CaptureFailure::NoInterface(backend) => write!(f, "{}-no-interface", backend),
            CaptureFailure::StartFailed(backend) => write!(f, "{}-start-failed", backend),
            CaptureFailure::Exited(reason) => write!(f, "{}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    NotStarted,
    Starting,
    Running {
        mode: &'static str,
        interfaces: Vec<String>,
    },
    Failed {
        failure: CaptureFailure,
        mode: Option<&'static str>,
        interfaces: Vec<String>,
    },
}

/// Capture state shared with backend reader tasks
#[derive(Debug)]
pub struct CaptureShared {
    state: Mutex<CaptureState>,
}

impl CaptureShared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CaptureState::NotStarted),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, next: CaptureState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("Capture state: {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Record that a running capture stopped on its own
    pub fn mark_exited(&self, reason: String) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (mode, interfaces) = match &*state {
            CaptureState::Running { mode, interfaces } => (Some(*mode), interfaces.clone()),
            CaptureState::Failed {
                mode, interfaces, ..
            } => (*mode, interfaces.clone()),
            _ => (None, Vec::new()),
        };
        *state = CaptureState::Failed {
            failure: CaptureFailure::Exited(reason),
            mode,
            interfaces,
        };
    }
}

impl Default for CaptureShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture part of the `network_capture` status
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub capture_available: bool,
    pub sniffer_running: bool,
    pub sniffer_error: Option<String>,
    pub sniffer_mode: Option<&'static str>,
    pub capture_method: String,
    pub ifaces: Vec<String>,
}

/// Capture settings taken from the agent configuration
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub method: String,
    pub interfaces: Vec<String>,
    pub tcpdump_path: String,
}

/// Starts capture at most once per process and reports its status
///
/// Capture failures never propagate: they become a reason code in the
/// status and the rest of the payload keeps streaming.
pub struct CaptureAdapter {
    settings: CaptureSettings,
    backend: Option<Box<dyn CaptureBackend>>,
    capture_available: bool,
    started: AtomicBool,
    start_lock: tokio::sync::Mutex<()>,
    shared: Arc<CaptureShared>,
}

impl CaptureAdapter {
    pub fn new(settings: CaptureSettings) -> Self {
        let backend = create_capture_backend(&settings.method, &settings.tcpdump_path);
        Self::with_backend(settings, backend)
    }

    pub fn with_backend(settings: CaptureSettings, backend: Option<Box<dyn CaptureBackend>>) -> Self {
        let capture_available = backend.as_ref().is_some_and(|b| b.is_available());
        if let Some(backend) = &backend {
            log::debug!(
                "Capture backend {} available: {}",
                backend.name(),
                capture_available
            );
        }
        Self {
            settings,
            backend,
            capture_available,
            started: AtomicBool::new(false),
            start_lock: tokio::sync::Mutex::new(()),
            shared: Arc::new(CaptureShared::new()),
        }
    }

    /// Start capture unless it was already attempted
    ///
    /// Concurrent callers serialize on the start lock; exactly one of them
    /// performs the attempt, whatever its outcome.
    pub async fn ensure_started(&self, sink: Arc<FlowAggregator>) {
        if self.started.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.start_lock.lock().await;
        if self.started.load(Ordering::Acquire) {
            return;
        }

        self.shared.set(CaptureState::Starting);
        let next = self.start(sink).await;
        match &next {
            CaptureState::Running { mode, interfaces } => {
                log::info!("Capture running via {} on {:?}", mode, interfaces)
            }
            CaptureState::Failed { failure, .. } => log::warn!("Capture unavailable: {}", failure),
            _ => {}
        }
        // a fast-exiting subprocess may already have recorded its diagnostic
        if !matches!(self.shared.state(), CaptureState::Failed { .. }) {
            self.shared.set(next);
        }
        self.started.store(true, Ordering::Release);
    }

    async fn start(&self, sink: Arc<FlowAggregator>) -> CaptureState {
        let Some(backend) = &self.backend else {
            return CaptureState::Failed {
                failure: CaptureFailure::Disabled,
                mode: None,
                interfaces: Vec::new(),
            };
        };

        warn_if_unprivileged();

        let interfaces = self.select_interfaces().await;
        log::info!("Capture interfaces: {:?}", interfaces);

        // set Running first so an immediate exit lands on top of it
        self.shared.set(CaptureState::Running {
            mode: backend.name(),
            interfaces: interfaces.clone(),
        });
        match backend.start(&interfaces, sink, Arc::clone(&self.shared)) {
            Ok(()) => self.shared.state(),
            Err(failure) => CaptureState::Failed {
                failure,
                mode: None,
                interfaces: Vec::new(),
            },
        }
    }

    /// Override list, else the default-route interface, else every
    /// interface that is up and not loopback
    async fn select_interfaces(&self) -> Vec<String> {
        if !self.settings.interfaces.is_empty() {
            return self.settings.interfaces.clone();
        }
        if let Some(iface) = default_route_interface().await {
            return vec![iface];
        }
        pnet_datalink::interfaces()
            .into_iter()
            .filter(|iface| iface.is_up() && !iface.is_loopback())
            .map(|iface| iface.name)
            .collect()
    }

    pub fn report(&self) -> CaptureReport {
        let (running, error, mode, ifaces) = match self.shared.state() {
            CaptureState::NotStarted | CaptureState::Starting => (false, None, None, Vec::new()),
            CaptureState::Running { mode, interfaces } => (true, None, Some(mode), interfaces),
            CaptureState::Failed {
                failure,
                mode,
                interfaces,
            } => (false, Some(failure.to_string()), mode, interfaces),
        };
        CaptureReport {
            capture_available: self.capture_available,
            sniffer_running: running,
            sniffer_error: error,
            sniffer_mode: mode,
            capture_method: self.settings.method.clone(),
            ifaces,
        }
    }
}

fn warn_if_unprivileged() {
    #[cfg(unix)]
    if !nix::unistd::Uid::effective().is_root() {
        log::warn!("Not running as root; packet capture will likely be refused");
    }
}

/// Interface carrying the default route
#[cfg(target_os = "linux")]
async fn default_route_interface() -> Option<String> {
    let routes = tokio::task::spawn_blocking(procfs::net::route).await.ok()?.ok()?;
    routes
        .into_iter()
        .find(|route| route.destination.is_unspecified() && route.mask.is_unspecified())
        .map(|route| route.iface)
}

/// Interface carrying the default route
#[cfg(not(target_os = "linux"))]
async fn default_route_interface() -> Option<String> {
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        tokio::process::Command::new("route")
            .args(["-n", "get", "default"])
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    parse_route_get(&String::from_utf8_lossy(&output.stdout))
}

/// `interface: en0` line of `route -n get default`
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_route_get(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        (key.trim() == "interface" && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

/// Resolve a program name on PATH, or check an explicit path
pub fn find_executable(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::AddressRegistry;
    use crate::connections::ConnectionTable;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        starts: Arc<AtomicUsize>,
        result: Result<(), CaptureFailure>,
    }

    impl CaptureBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn is_available(&self) -> bool {
            self.result.is_ok()
        }

        fn start(
            &self,
            _interfaces: &[String],
            _sink: Arc<FlowAggregator>,
            _shared: Arc<CaptureShared>,
        ) -> Result<(), CaptureFailure> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn settings(method: &str) -> CaptureSettings {
        CaptureSettings {
            method: method.to_string(),
            interfaces: vec!["eth0".to_string()],
            tcpdump_path: "tcpdump".to_string(),
        }
    }

    fn sink() -> Arc<FlowAggregator> {
        Arc::new(FlowAggregator::new(
            Arc::new(AddressRegistry::with_addresses([])),
            Arc::new(ConnectionTable::with_mapper(None)),
            0,
        ))
    }

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(CaptureFailure::Disabled.to_string(), "capture-disabled");
        assert_eq!(
            CaptureFailure::ToolMissing("tcpdump").to_string(),
            "tcpdump-not-installed"
        );
        assert_eq!(
            CaptureFailure::NoInterface("tcpdump").to_string(),
            "tcpdump-no-interface"
        );
        assert_eq!(
            CaptureFailure::StartFailed("pnet").to_string(),
            "pnet-start-failed"
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_disabled() {
        let adapter = CaptureAdapter::new(settings("off"));
        adapter.ensure_started(sink()).await;

        let report = adapter.report();
        assert!(!report.capture_available);
        assert!(!report.sniffer_running);
        assert_eq!(report.sniffer_error.as_deref(), Some("capture-disabled"));
        assert_eq!(report.capture_method, "off");
    }

    #[tokio::test]
    async fn test_concurrent_starts_run_backend_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let backend = FakeBackend {
            starts: Arc::clone(&starts),
            result: Ok(()),
        };
        let adapter = Arc::new(CaptureAdapter::with_backend(
            settings("fake"),
            Some(Box::new(backend)),
        ));

        let sink = sink();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let adapter = Arc::clone(&adapter);
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move { adapter.ensure_started(sink).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        let report = adapter.report();
        assert!(report.sniffer_running);
        assert_eq!(report.sniffer_mode, Some("fake"));
        assert_eq!(report.ifaces, vec!["eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_start_is_not_retried() {
        let starts = Arc::new(AtomicUsize::new(0));
        let backend = FakeBackend {
            starts: Arc::clone(&starts),
            result: Err(CaptureFailure::ToolMissing("fake")),
        };
        let adapter = CaptureAdapter::with_backend(settings("fake"), Some(Box::new(backend)));

        adapter.ensure_started(sink()).await;
        adapter.ensure_started(sink()).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        let report = adapter.report();
        assert!(!report.sniffer_running);
        assert_eq!(report.sniffer_error.as_deref(), Some("fake-not-installed"));
    }

    #[test]
    fn test_exit_keeps_mode_and_interfaces() {
        let shared = CaptureShared::new();
        shared.set(CaptureState::Running {
            mode: "tcpdump",
            interfaces: vec!["en0".to_string()],
        });
        shared.mark_exited("tcpdump: en0: You don't have permission to capture".to_string());

        match shared.state() {
            CaptureState::Failed {
                failure,
                mode,
                interfaces,
            } => {
                assert!(failure.to_string().contains("permission"));
                assert_eq!(mode, Some("tcpdump"));
                assert_eq!(interfaces, vec!["en0".to_string()]);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_parse_route_get() {
        let output = "   route to: default\ndestination: default\n       mask: default\n    gateway: 192.168.1.1\n  interface: en0\n      flags: <UP,GATEWAY,DONE,STATIC,PRCLONING>\n";
        assert_eq!(parse_route_get(output).as_deref(), Some("en0"));
        assert_eq!(parse_route_get("gateway: 10.0.0.1\n"), None);
    }

    #[test]
    fn test_find_executable_rejects_missing() {
        assert!(find_executable("definitely-not-a-real-binary-name").is_none());
        assert!(find_executable("/nonexistent/dir/tcpdump").is_none());
    }
}
