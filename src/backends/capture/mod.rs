// Packet capture backend trait and implementations

use crate::capture::{CaptureFailure, CaptureShared};
use crate::flows::FlowAggregator;
use std::sync::Arc;

pub mod tcpdump;

#[cfg(feature = "capture-pnet")]
pub mod pnet;

/// Packet capture backend trait
///
/// A backend owns whatever produces packets (a subprocess, a datalink
/// channel) and feeds every parsed event into the aggregator. Started at
/// most once per process by the capture adapter.
pub trait CaptureBackend: Send + Sync {
    /// Backend name, reported as `sniffer_mode`
    fn name(&self) -> &'static str;

    /// Whether the backend's tooling is present on this host
    fn is_available(&self) -> bool;

    /// Begin capturing on the selected interfaces
    ///
    /// Returns once capture is running; reading happens on background
    /// tasks or threads. Later exits are reported through `shared`.
    fn start(
        &self,
        interfaces: &[String],
        sink: Arc<FlowAggregator>,
        shared: Arc<CaptureShared>,
    ) -> Result<(), CaptureFailure>;
}

/// Create a capture backend by configured method name
pub fn create_capture_backend(method: &str, tcpdump_path: &str) -> Option<Box<dyn CaptureBackend>> {
    match method {
        "tcpdump" => Some(Box::new(tcpdump::TcpdumpBackend::new(tcpdump_path))),

        #[cfg(feature = "capture-pnet")]
        "pnet" => Some(Box::new(pnet::PnetBackend)),

        _ => None,
    }
}
