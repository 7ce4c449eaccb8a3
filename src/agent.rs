// Process-wide state shared by every session

use crate::addresses::AddressRegistry;
use crate::capture::{CaptureAdapter, CaptureSettings};
use crate::config::Config;
use crate::connections::ConnectionTable;
use crate::flows::FlowAggregator;
use crate::geo::{GeoCache, GeoSettings, GeoTransport, HttpTransport};
use crate::payload::CaptureStatus;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::MissedTickBehavior;

/// Address registry and connection table rebuild period
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Singletons that outlive any one client connection
///
/// Built once at startup and handed to every session by `Arc`. The
/// background work (capture, registry refresh) starts with the first
/// session, not at construction.
pub struct Agent {
    config: Config,
    addresses: Arc<AddressRegistry>,
    connections: Arc<ConnectionTable>,
    flows: Arc<FlowAggregator>,
    geo: GeoCache,
    capture: CaptureAdapter,
    refresh_started: OnceCell<()>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(config.geo_timeout())?;
        let capture = CaptureAdapter::new(CaptureSettings {
            method: config.capture_method.clone(),
            interfaces: config.capture_interfaces.clone(),
            tcpdump_path: config.tcpdump_path.clone(),
        });
        Ok(Self::with_parts(
            config,
            Arc::new(AddressRegistry::new()),
            Arc::new(ConnectionTable::new()),
            capture,
            Arc::new(transport),
        ))
    }

    pub fn with_parts(
        config: Config,
        addresses: Arc<AddressRegistry>,
        connections: Arc<ConnectionTable>,
        capture: CaptureAdapter,
        transport: Arc<dyn GeoTransport>,
    ) -> Self {
        let flows = Arc::new(FlowAggregator::new(
            Arc::clone(&addresses),
            Arc::clone(&connections),
            config.max_flow_keys,
        ));
        let geo = GeoCache::new(
            GeoSettings {
                primary_url: config.geoip_api_url.clone(),
                fallback_urls: config.geoip_fallback_urls.clone(),
                api_key: config.geoip_api_key.clone(),
                failure_ttl: config.geo_failure_ttl(),
            },
            transport,
        );
        Self {
            config,
            addresses,
            connections,
            flows,
            geo,
            capture,
            refresh_started: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn flows(&self) -> &Arc<FlowAggregator> {
        &self.flows
    }

    pub fn geo(&self) -> &GeoCache {
        &self.geo
    }

    /// Start the refresh loop and packet capture; later calls are no-ops
    ///
    /// The first local address enumeration completes before capture starts,
    /// so early packets are classified against the real address set.
    pub async fn ensure_started(&self) {
        self.refresh_started
            .get_or_init(|| async {
                let addresses = Arc::clone(&self.addresses);
                if let Err(e) = tokio::task::spawn_blocking(move || addresses.refresh()).await {
                    log::warn!("Initial address refresh failed: {}", e);
                }
                self.spawn_refresh_loop();
            })
            .await;
        self.capture.ensure_started(Arc::clone(&self.flows)).await;
    }

    fn spawn_refresh_loop(&self) {
        log::info!(
            "Starting address and connection refresh every {:?}",
            REFRESH_INTERVAL
        );

        // separate loops so a stalled socket mapper never holds back address updates
        let addresses = Arc::clone(&self.addresses);
        spawn_periodic("Address refresh", move || addresses.refresh());
        let connections = Arc::clone(&self.connections);
        spawn_periodic("Connection table refresh", move || connections.refresh());
    }

    /// Current `network_capture` object
    pub fn capture_status(&self) -> CaptureStatus {
        CaptureStatus::new(
            self.capture.report(),
            self.flows.stats(),
            self.flows.key_count(),
            self.geo.cached_count(),
            self.geo.inflight_count(),
            self.addresses.len(),
        )
    }
}

/// Run a blocking job every `REFRESH_INTERVAL` on the blocking pool
fn spawn_periodic<F>(what: &'static str, job: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let job = Arc::new(job);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let job = Arc::clone(&job);
            if let Err(e) = tokio::task::spawn_blocking(move || job()).await {
                log::warn!("{} failed: {}", what, e);
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backends::capture::CaptureBackend;
    use crate::capture::{CaptureFailure, CaptureShared};
    use anyhow::anyhow;
    use serde_json::Value;
    use std::future::Future;
    use std::net::IpAddr;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Answers every lookup with a fixed body, recording requested URLs
    pub(crate) struct StaticTransport {
        pub body: Option<Value>,
        pub urls: Mutex<Vec<String>>,
    }

    impl GeoTransport for StaticTransport {
        fn fetch_json<'a>(
            &'a self,
            url: &'a str,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>> {
            Box::pin(async move {
                self.urls.lock().unwrap().push(url.to_string());
                self.body.clone().ok_or_else(|| anyhow!("no record"))
            })
        }
    }

    /// Agent with capture disabled and a fixed local address set
    pub(crate) fn test_agent(locals: &[&str], transport: Arc<StaticTransport>) -> Agent {
        let mut config = Config::default();
        config.capture_method = "none".to_string();
        let addresses = Arc::new(AddressRegistry::with_addresses(
            locals.iter().map(|s| s.parse::<IpAddr>().unwrap()),
        ));
        let capture = CaptureAdapter::with_backend(
            CaptureSettings {
                method: config.capture_method.clone(),
                interfaces: Vec::new(),
                tcpdump_path: config.tcpdump_path.clone(),
            },
            None,
        );
        Agent::with_parts(
            config,
            addresses,
            Arc::new(ConnectionTable::with_mapper(None)),
            capture,
            transport,
        )
    }

    pub(crate) fn no_geo() -> Arc<StaticTransport> {
        Arc::new(StaticTransport {
            body: None,
            urls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        let status = agent.capture_status();
        assert!(!status.capture_available);
        assert!(!status.sniffer_running);
        assert_eq!(status.sniffer_error, None);
        assert_eq!(status.capture_method, "none");
        // 10.0.0.5 plus both loopbacks
        assert_eq!(status.local_ip_count, 3);
    }

    #[tokio::test]
    async fn test_disabled_capture_reports_reason() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        agent.ensure_started().await;
        agent.ensure_started().await;

        let status = agent.capture_status();
        assert!(!status.capture_available);
        assert!(!status.sniffer_running);
        assert_eq!(status.sniffer_error.as_deref(), Some("capture-disabled"));
        assert!(status.ifaces.is_empty());
        assert_eq!(status.flow_keys, 0);
        assert!(agent.refresh_started.initialized());
    }

    /// Records whether a placeholder address was still registered at start
    struct SeenAtStart {
        addresses: Arc<AddressRegistry>,
        placeholder: IpAddr,
        saw_placeholder: Arc<Mutex<Option<bool>>>,
    }

    impl CaptureBackend for SeenAtStart {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn start(
            &self,
            _interfaces: &[String],
            _sink: Arc<FlowAggregator>,
            _shared: Arc<CaptureShared>,
        ) -> Result<(), CaptureFailure> {
            let seen = self.addresses.snapshot().contains(&self.placeholder);
            *self.saw_placeholder.lock().unwrap() = Some(seen);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_addresses_enumerated_before_capture_starts() {
        let placeholder: IpAddr = "203.0.113.9".parse().unwrap();
        let addresses = Arc::new(AddressRegistry::with_addresses([placeholder]));
        let saw_placeholder = Arc::new(Mutex::new(None));
        let backend = SeenAtStart {
            addresses: Arc::clone(&addresses),
            placeholder,
            saw_placeholder: Arc::clone(&saw_placeholder),
        };
        let capture = CaptureAdapter::with_backend(
            CaptureSettings {
                method: "fake".to_string(),
                interfaces: vec!["lo".to_string()],
                tcpdump_path: "tcpdump".to_string(),
            },
            Some(Box::new(backend)),
        );
        let agent = Agent::with_parts(
            Config::default(),
            addresses,
            Arc::new(ConnectionTable::with_mapper(None)),
            capture,
            no_geo(),
        );

        agent.ensure_started().await;

        // the seeded address is gone once the host's own interfaces are read
        assert_eq!(*saw_placeholder.lock().unwrap(), Some(false));
        assert!(agent.capture_status().sniffer_running);
    }
}
