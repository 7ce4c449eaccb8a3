// Per-connection streaming loop
//
// Accepting: start process-wide capture, take baselines. Streaming: one
// payload per second built from already-consistent snapshots. Closed: the
// per-session probe cells and accumulators are dropped with the session.

use crate::agent::Agent;
use crate::flows::{FlowSnapshot, top_flows};
use crate::payload::{
    BatteryPayload, CpuPayload, DiskPayload, EnergyPayload, FlowPayload, MemoryPayload,
    NetworkPayload, Payload, ThermalPayload, unix_timestamp,
};
use crate::probes::{
    BatteryReading, EnergyReading, LatencyReading, MemoryReading, ProbeSet, ProcessEntry,
    ThermalReading,
};
use crate::sustainability::SustainabilityAccumulator;
use crate::system::{DiskCounters, IoRates, NetCounters, SystemSample, SystemSampler};
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// `network_flows` entries per payload
pub const TOP_FLOW_LIMIT: usize = 24;

const MIN_ELAPSED_SECS: f64 = 1e-6;

/// Latest value of every probe, borrowed for one tick
#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeValues<'a> {
    pub energy: Option<&'a EnergyReading>,
    pub thermal: Option<&'a ThermalReading>,
    pub memory: Option<&'a MemoryReading>,
    pub battery: Option<&'a BatteryReading>,
    pub latency: Option<&'a LatencyReading>,
    pub processes: Option<&'a Vec<ProcessEntry>>,
}

impl<'a> From<&'a ProbeSet> for ProbeValues<'a> {
    fn from(probes: &'a ProbeSet) -> Self {
        Self {
            energy: probes.energy.value(),
            thermal: probes.thermal.value(),
            memory: probes.memory.value(),
            battery: probes.battery.value(),
            latency: probes.latency.value(),
            processes: probes.processes.value(),
        }
    }
}

/// Previous-tick baselines plus the session's running totals
pub struct TickState {
    net: NetCounters,
    disk: DiskCounters,
    flows: FlowSnapshot,
    at: Instant,
    sustainability: SustainabilityAccumulator,
}

impl TickState {
    pub fn new(baseline: &SystemSample, flows: FlowSnapshot, at: Instant, kwh_per_gb: f64) -> Self {
        Self {
            net: baseline.network,
            disk: baseline.disk,
            flows,
            at,
            sustainability: SustainabilityAccumulator::new(kwh_per_gb),
        }
    }

    /// Fold one tick's samples into a payload and advance the baselines
    ///
    /// Never blocks: geolocation is only enqueued, and whatever is already
    /// cached is attached.
    pub fn build(
        &mut self,
        agent: &Agent,
        sample: SystemSample,
        flows: FlowSnapshot,
        probes: ProbeValues<'_>,
        now: Instant,
    ) -> Payload {
        let elapsed = now
            .saturating_duration_since(self.at)
            .as_secs_f64()
            .max(MIN_ELAPSED_SECS);
        let rates = IoRates::between(&self.net, &sample.network, &self.disk, &sample.disk, elapsed);

        let deltas = flows.deltas_since(&self.flows);
        for delta in &deltas {
            agent.geo().enqueue(delta.key.remote_addr);
        }
        let network_flows = top_flows(deltas, TOP_FLOW_LIMIT)
            .iter()
            .map(|delta| FlowPayload::new(delta, elapsed, agent.geo().get(&delta.key.remote_addr)))
            .collect();

        self.sustainability.record(
            probes.energy.and_then(|reading| reading.wattage),
            elapsed,
            rates.network_bytes,
        );

        let cpu_total = f64::from(sample.cpu.total);
        let payload = Payload {
            timestamp: unix_timestamp(),
            memory: MemoryPayload::new(&sample.memory, probes.memory),
            disk: DiskPayload::new(&sample.disk, &rates),
            network: NetworkPayload::new(&sample.network, &rates, probes.latency),
            cpu: CpuPayload::from(sample.cpu),
            network_flows,
            network_capture: agent.capture_status(),
            energy: EnergyPayload::from(probes.energy),
            thermal: ThermalPayload::new(probes.thermal, cpu_total),
            sustainability: self.sustainability.report(),
            battery: BatteryPayload::from(probes.battery),
            processes: probes.processes.cloned().unwrap_or_default(),
        };

        self.net = sample.network;
        self.disk = sample.disk;
        self.flows = flows;
        self.at = now;
        payload
    }
}

/// One connected client
pub struct StreamingSession {
    agent: Arc<Agent>,
    sampler: Arc<Mutex<SystemSampler>>,
    probes: ProbeSet,
    state: TickState,
}

impl StreamingSession {
    /// Accepting phase
    pub async fn accept(agent: Arc<Agent>) -> Result<Self> {
        agent.ensure_started().await;

        let latency_target = agent.config().latency_target.clone();
        let (sampler, baseline, probes) = tokio::task::spawn_blocking(move || {
            let mut sampler = SystemSampler::new();
            let baseline = sampler.sample();
            (sampler, baseline, ProbeSet::new(&latency_target))
        })
        .await
        .context("Failed to take session baseline")?;

        let state = TickState::new(
            &baseline,
            agent.flows().snapshot(),
            Instant::now(),
            agent.config().network_kwh_per_gb,
        );
        Ok(Self {
            agent,
            sampler: Arc::new(Mutex::new(sampler)),
            probes,
            state,
        })
    }

    pub async fn tick(&mut self) -> Result<Payload> {
        let sampler = Arc::clone(&self.sampler);
        let sample = tokio::task::spawn_blocking(move || {
            sampler.lock().unwrap_or_else(|e| e.into_inner()).sample()
        })
        .await
        .context("System sampling failed")?;

        let now = Instant::now();
        let flows = self.agent.flows().snapshot();
        self.probes.advance(now);
        Ok(self.state.build(
            &self.agent,
            sample,
            flows,
            ProbeValues::from(&self.probes),
            now,
        ))
    }
}

/// Drive one WebSocket until the client goes away
pub async fn run(agent: Arc<Agent>, mut socket: WebSocket) {
    let mut session = match StreamingSession::accept(agent).await {
        Ok(session) => session,
        Err(e) => {
            log::warn!("Session setup failed: {:#}", e);
            return;
        }
    };
    log::info!("Session opened");

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; rates need a full interval
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = match session.tick().await {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Skipping tick: {:#}", e);
                        continue;
                    }
                };
                let text = match serde_json::to_string(&payload) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Failed to encode payload: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    log::info!("Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{StaticTransport, no_geo, test_agent};
    use crate::flows::PacketEvent;
    use crate::system::{CpuSample, MemorySample};
    use crate::traffic_classifier::Protocol;
    use serde_json::json;

    fn sample(bytes_sent: u64, bytes_recv: u64) -> SystemSample {
        SystemSample {
            cpu: CpuSample {
                per_core: vec![10.0, 30.0],
                total: 20.0,
            },
            memory: MemorySample {
                used: 8,
                total: 16,
                percent: 50.0,
                swap_used: 0,
                swap_total: 0,
                swap_percent: 0.0,
            },
            network: NetCounters {
                bytes_sent,
                bytes_recv,
            },
            disk: DiskCounters::default(),
        }
    }

    fn outbound(remote: &str, length: u64) -> PacketEvent {
        PacketEvent {
            src_addr: "10.0.0.5".parse().unwrap(),
            src_port: 54321,
            dst_addr: remote.parse().unwrap(),
            dst_port: 443,
            protocol: Protocol::Tcp,
            length,
        }
    }

    #[tokio::test]
    async fn test_capture_unavailable_payload_still_streams() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        agent.ensure_started().await;

        let start = Instant::now();
        let mut state = TickState::new(&sample(0, 0), agent.flows().snapshot(), start, 0.06);
        let energy = EnergyReading {
            wattage: Some(36.0),
            source: "rapl",
        };
        let probes = ProbeValues {
            energy: Some(&energy),
            ..Default::default()
        };

        for second in 1..=3u64 {
            let payload = state.build(
                &agent,
                sample(second * 1024 * 1024, 0),
                agent.flows().snapshot(),
                probes,
                start + Duration::from_secs(second),
            );
            let capture = &payload.network_capture;
            assert!(!capture.capture_available);
            assert!(!capture.sniffer_running);
            assert_eq!(capture.sniffer_error.as_deref(), Some("capture-disabled"));
            assert!(payload.network_flows.is_empty());

            assert_eq!(payload.cpu.per_core, vec![10.0, 30.0]);
            assert_eq!(payload.memory.pressure, 50.0);
            assert_eq!(payload.network.upload_mb_s, 1.0);
            assert_eq!(payload.energy.wattage, Some(36.0));
        }
        let payload = state.build(
            &agent,
            sample(3 * 1024 * 1024, 0),
            agent.flows().snapshot(),
            probes,
            start + Duration::from_secs(4),
        );
        assert!((payload.sustainability.energy_kwh - 36.0 * 4.0 / 3_600_000.0).abs() < 1e-15);
        assert_eq!(payload.sustainability.network.bytes, 3 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_flow_deltas_per_tick() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        let start = Instant::now();
        let mut state = TickState::new(&sample(0, 0), agent.flows().snapshot(), start, 0.06);

        agent.flows().record(&outbound("93.184.216.34", 64));
        agent.flows().record(&outbound("93.184.216.34", 36));
        let payload = state.build(
            &agent,
            sample(0, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start + Duration::from_secs(1),
        );
        assert_eq!(payload.network_flows.len(), 1);
        let flow = serde_json::to_value(&payload.network_flows[0]).unwrap();
        assert_eq!(flow["direction"], json!("outbound"));
        assert_eq!(flow["ip"], json!("93.184.216.34"));
        assert_eq!(flow["protocol"], json!("TCP"));
        assert_eq!(flow["app"], json!("unknown"));
        assert_eq!(flow["bytes"], json!(100));

        // nothing new: nothing reported
        let payload = state.build(
            &agent,
            sample(0, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start + Duration::from_secs(2),
        );
        assert!(payload.network_flows.is_empty());
        assert_eq!(payload.network_capture.flow_keys, 1);
    }

    #[tokio::test]
    async fn test_flows_truncated_to_top_entries() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        let start = Instant::now();
        let mut state = TickState::new(&sample(0, 0), agent.flows().snapshot(), start, 0.06);

        for i in 1..=30u64 {
            agent.flows().record(&outbound(&format!("93.184.216.{}", i), i * 10));
        }
        let payload = state.build(
            &agent,
            sample(0, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start + Duration::from_secs(1),
        );
        let bytes: Vec<u64> = payload.network_flows.iter().map(|f| f.bytes).collect();
        assert_eq!(bytes.len(), TOP_FLOW_LIMIT);
        assert_eq!(bytes[0], 300);
        assert_eq!(bytes[23], 70);
        assert!(bytes.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn test_resolved_location_attached_on_later_tick() {
        let transport = Arc::new(StaticTransport {
            body: Some(json!({
                "latitude": 42.15,
                "longitude": -70.82,
                "country_name": "United States",
                "country_code": "US",
                "city": "Norwell"
            })),
            urls: Mutex::new(Vec::new()),
        });
        let agent = test_agent(&["10.0.0.5"], Arc::clone(&transport));
        let start = Instant::now();
        let mut state = TickState::new(&sample(0, 0), agent.flows().snapshot(), start, 0.06);

        agent.flows().record(&outbound("93.184.216.34", 64));
        let first = state.build(
            &agent,
            sample(0, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start + Duration::from_secs(1),
        );
        assert_eq!(first.network_flows[0].lat, None);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        agent.flows().record(&outbound("93.184.216.34", 64));
        let second = state.build(
            &agent,
            sample(0, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start + Duration::from_secs(2),
        );
        assert_eq!(second.network_flows[0].country_code.as_deref(), Some("US"));
        assert_eq!(transport.urls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_elapsed_does_not_divide_by_zero() {
        let agent = test_agent(&["10.0.0.5"], no_geo());
        let start = Instant::now();
        let mut state = TickState::new(&sample(0, 0), agent.flows().snapshot(), start, 0.06);
        let payload = state.build(
            &agent,
            sample(1024, 0),
            agent.flows().snapshot(),
            ProbeValues::default(),
            start,
        );
        assert!(payload.network.upload_mb_s.is_finite());
        assert!(serde_json::to_string(&payload).is_ok());
    }
}
