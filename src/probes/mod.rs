// Multi-rate sensor scheduling
//
// Each sensor runs in the background on its own interval; the tick loop only
// ever polls for completed results and never waits on a probe.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub mod battery;
pub mod command;
pub mod energy;
pub mod latency;
pub mod memory;
pub mod processes;
pub mod thermal;

pub use battery::{BatteryProbe, BatteryReading};
pub use energy::{EnergyProbe, EnergyReading};
pub use latency::{LatencyProbe, LatencyReading};
pub use memory::{MemoryProbe, MemoryReading};
pub use processes::{ProcessEntry, ProcessProbe};
pub use thermal::{ThermalProbe, ThermalReading, estimate_cpu_temperature};

/// Upper bound on a single background invocation
const DEFAULT_DEADLINE: Duration = Duration::from_millis(3500);

/// An external sensor
///
/// `sample` reports `None` when the sensor is unavailable; internal
/// failures never escape it.
pub trait Probe: Send + Sync + 'static {
    type Output: Clone + Send + 'static;

    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn deadline(&self) -> Duration {
        DEFAULT_DEADLINE
    }

    fn sample(&self) -> impl Future<Output = Option<Self::Output>> + Send;
}

/// Last-known value of one probe plus its in-flight invocation
pub struct ProbeCell<P: Probe> {
    probe: Arc<P>,
    last: Option<P::Output>,
    completed_at: Option<Instant>,
    pending: Option<oneshot::Receiver<Option<P::Output>>>,
}

impl<P: Probe> ProbeCell<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe: Arc::new(probe),
            last: None,
            completed_at: None,
            pending: None,
        }
    }

    /// Collect a finished invocation, then launch the next one if due
    pub fn advance(&mut self, now: Instant) {
        if let Some(rx) = &mut self.pending {
            match rx.try_recv() {
                Ok(result) => self.complete(result, now),
                Err(TryRecvError::Empty) => {}
                // task panicked or was dropped
                Err(TryRecvError::Closed) => self.complete(None, now),
            }
        }

        if self.pending.is_none() && self.is_due(now) {
            self.launch();
        }
    }

    fn complete(&mut self, result: Option<P::Output>, now: Instant) {
        if result.is_none() {
            log::debug!("Probe {} unavailable", self.probe.name());
        }
        self.last = result;
        self.completed_at = Some(now);
        self.pending = None;
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.completed_at {
            Some(at) => now.saturating_duration_since(at) >= self.probe.interval(),
            None => true,
        }
    }

    fn launch(&mut self) {
        let (tx, rx) = oneshot::channel();
        let probe = Arc::clone(&self.probe);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(probe.deadline(), probe.sample()).await {
                Ok(result) => result,
                Err(_) => {
                    log::debug!("Probe {} timed out", probe.name());
                    None
                }
            };
            // receiver is gone once the session ends
            let _ = tx.send(result);
        });
        self.pending = Some(rx);
    }

    /// Most recent completed result
    pub fn value(&self) -> Option<&P::Output> {
        self.last.as_ref()
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// The per-session set of sensor cells
pub struct ProbeSet {
    pub energy: ProbeCell<EnergyProbe>,
    pub thermal: ProbeCell<ThermalProbe>,
    pub memory: ProbeCell<MemoryProbe>,
    pub battery: ProbeCell<BatteryProbe>,
    pub latency: ProbeCell<LatencyProbe>,
    pub processes: ProbeCell<ProcessProbe>,
}

impl ProbeSet {
    pub fn new(latency_target: &str) -> Self {
        Self {
            energy: ProbeCell::new(EnergyProbe),
            thermal: ProbeCell::new(ThermalProbe),
            memory: ProbeCell::new(MemoryProbe),
            battery: ProbeCell::new(BatteryProbe),
            latency: ProbeCell::new(LatencyProbe::new(latency_target)),
            processes: ProbeCell::new(ProcessProbe::new()),
        }
    }

    pub fn advance(&mut self, now: Instant) {
        self.energy.advance(now);
        self.thermal.advance(now);
        self.memory.advance(now);
        self.battery.advance(now);
        self.latency.advance(now);
        self.processes.advance(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Each invocation waits for a permit from the gate
    struct GatedProbe {
        calls: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
        interval: Duration,
    }

    impl Probe for GatedProbe {
        type Output = usize;

        fn name(&self) -> &'static str {
            "gated"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(3600)
        }

        async fn sample(&self) -> Option<usize> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.gate.acquire().await.ok()?.forget();
            Some(n)
        }
    }

    struct FailingProbe;

    impl Probe for FailingProbe {
        type Output = u32;

        fn name(&self) -> &'static str {
            "failing"
        }

        fn interval(&self) -> Duration {
            Duration::ZERO
        }

        async fn sample(&self) -> Option<u32> {
            None
        }
    }

    struct PanickingProbe;

    impl Probe for PanickingProbe {
        type Output = u32;

        fn name(&self) -> &'static str {
            "panicking"
        }

        fn interval(&self) -> Duration {
            Duration::ZERO
        }

        async fn sample(&self) -> Option<u32> {
            panic!("sensor exploded")
        }
    }

    struct HungProbe;

    impl Probe for HungProbe {
        type Output = u8;

        fn name(&self) -> &'static str {
            "hung"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(2)
        }

        async fn sample(&self) -> Option<u8> {
            std::future::pending().await
        }
    }

    /// Let spawned tasks run on the current-thread runtime
    async fn drain() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn gated(interval: Duration) -> (ProbeCell<GatedProbe>, Arc<AtomicUsize>, Arc<Semaphore>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let cell = ProbeCell::new(GatedProbe {
            calls: Arc::clone(&calls),
            gate: Arc::clone(&gate),
            interval,
        });
        (cell, calls, gate)
    }

    #[tokio::test]
    async fn test_slow_probe_serves_last_value() {
        let (mut cell, calls, gate) = gated(Duration::from_secs(5));

        let start = Instant::now();
        cell.advance(start);
        assert!(cell.is_pending());
        assert_eq!(cell.value(), None);

        // stuck probe: ticks keep going, no second launch
        for second in 1..10 {
            drain().await;
            cell.advance(start + Duration::from_secs(second));
            assert_eq!(cell.value(), None);
            assert!(cell.is_pending());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        gate.add_permits(1);
        drain().await;
        cell.advance(start + Duration::from_secs(10));
        assert_eq!(cell.value(), Some(&1));
        assert!(!cell.is_pending());
    }

    #[tokio::test]
    async fn test_interval_respected_between_runs() {
        let (mut cell, calls, gate) = gated(Duration::from_secs(5));
        gate.add_permits(10);

        let start = Instant::now();
        cell.advance(start);
        drain().await;
        cell.advance(start + Duration::from_secs(1));
        assert_eq!(cell.value(), Some(&1));
        assert!(!cell.is_pending());

        for second in 2..6 {
            cell.advance(start + Duration::from_secs(second));
            assert!(!cell.is_pending());
        }
        cell.advance(start + Duration::from_secs(6));
        assert!(cell.is_pending());
        // previous value still served while the refresh runs
        assert_eq!(cell.value(), Some(&1));

        drain().await;
        cell.advance(start + Duration::from_secs(7));
        assert_eq!(cell.value(), Some(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_result_replaces_value() {
        let mut cell = ProbeCell::new(FailingProbe);
        cell.last = Some(7);

        let now = Instant::now();
        cell.advance(now);
        drain().await;
        cell.advance(now);
        assert_eq!(cell.value(), None);
    }

    #[tokio::test]
    async fn test_panicking_probe_is_contained() {
        let mut cell = ProbeCell::new(PanickingProbe);

        let now = Instant::now();
        cell.advance(now);
        drain().await;
        cell.advance(now);
        assert_eq!(cell.value(), None);
        // relaunched on the next due tick
        assert!(cell.is_pending());
    }

    #[test]
    fn test_sensor_deadlines_are_short() {
        let limit = Duration::from_millis(3500);
        assert!(MemoryProbe.deadline() <= limit);
        assert!(BatteryProbe.deadline() <= limit);
        assert!(LatencyProbe::new("127.0.0.1").deadline() <= limit);
        assert!(ProcessProbe::new().deadline() <= limit);
        #[cfg(not(target_os = "macos"))]
        {
            assert!(EnergyProbe.deadline() <= limit);
            assert!(ThermalProbe.deadline() <= limit);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_unavailable() {
        let mut cell = ProbeCell::new(HungProbe);
        let start = Instant::now();
        cell.advance(start);
        drain().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        drain().await;
        cell.advance(start + Duration::from_secs(3));
        assert!(!cell.is_pending());
        assert_eq!(cell.value(), None);
    }
}
