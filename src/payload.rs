// Streaming payload schema - one JSON object per tick

use crate::capture::CaptureReport;
use crate::flows::{Direction, FlowDelta, PipelineStats};
use crate::geo::GeoRecord;
use crate::probes::{
    BatteryReading, EnergyReading, LatencyReading, MemoryReading, ProcessEntry, ThermalReading,
    estimate_cpu_temperature,
};
use crate::sustainability::SustainabilityReport;
use crate::system::{CpuSample, DiskCounters, IoRates, MemorySample, NetCounters, percent};
use crate::traffic_classifier::Protocol;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    /// Unix seconds
    pub timestamp: f64,
    pub cpu: CpuPayload,
    pub memory: MemoryPayload,
    pub disk: DiskPayload,
    pub network: NetworkPayload,
    pub network_flows: Vec<FlowPayload>,
    pub network_capture: CaptureStatus,
    pub energy: EnergyPayload,
    pub thermal: ThermalPayload,
    pub sustainability: SustainabilityReport,
    pub battery: BatteryPayload,
    pub processes: Vec<ProcessEntry>,
}

pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuPayload {
    pub per_core: Vec<f32>,
    pub total: f32,
}

impl From<CpuSample> for CpuPayload {
    fn from(sample: CpuSample) -> Self {
        Self {
            per_core: sample.per_core,
            total: sample.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryPayload {
    pub used: u64,
    pub total: u64,
    pub pressure: f64,
    pub pressure_source: &'static str,
    pub swap_used: u64,
    pub swap_total: u64,
    pub swap_percent: f64,
}

impl MemoryPayload {
    /// Page-level accounting wins over the general sample when available
    pub fn new(sample: &MemorySample, detailed: Option<&MemoryReading>) -> Self {
        let (used, total, source) = match detailed {
            Some(reading) if reading.total > 0 => (reading.used, reading.total, reading.source),
            _ => (sample.used, sample.total, "sysinfo"),
        };
        Self {
            used,
            total,
            pressure: percent(used, total),
            pressure_source: source,
            swap_used: sample.swap_used,
            swap_total: sample.swap_total,
            swap_percent: sample.swap_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskPayload {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_mb_s: f64,
    pub write_mb_s: f64,
    pub read_iops: f64,
    pub write_iops: f64,
}

impl DiskPayload {
    pub fn new(counters: &DiskCounters, rates: &IoRates) -> Self {
        Self {
            read_bytes: counters.read_bytes,
            write_bytes: counters.write_bytes,
            read_mb_s: rates.read_mb_s,
            write_mb_s: rates.write_mb_s,
            read_iops: rates.read_iops,
            write_iops: rates.write_iops,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkPayload {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub upload_mb_s: f64,
    pub download_mb_s: f64,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

impl NetworkPayload {
    pub fn new(counters: &NetCounters, rates: &IoRates, latency: Option<&LatencyReading>) -> Self {
        Self {
            bytes_sent: counters.bytes_sent,
            bytes_recv: counters.bytes_recv,
            upload_mb_s: rates.upload_mb_s,
            download_mb_s: rates.download_mb_s,
            latency_ms: latency.map(|l| l.latency_ms),
            jitter_ms: latency.map(|l| l.jitter_ms),
        }
    }
}

/// One entry of `network_flows`; location fields stay null until the
/// address is resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowPayload {
    pub direction: Direction,
    pub ip: String,
    pub protocol: Protocol,
    pub app: String,
    pub bytes: u64,
    pub mb_s: f64,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl FlowPayload {
    pub fn new(delta: &FlowDelta, elapsed: f64, geo: Option<GeoRecord>) -> Self {
        let (country, country_code, city, lat, lon) = match geo {
            Some(geo) => (
                geo.country,
                geo.country_code,
                geo.city,
                Some(geo.lat),
                Some(geo.lon),
            ),
            None => (None, None, None, None, None),
        };
        Self {
            direction: delta.key.direction,
            ip: delta.key.remote_addr.to_string(),
            protocol: delta.key.protocol,
            app: delta.key.process_name.to_string(),
            bytes: delta.bytes,
            mb_s: delta.bytes as f64 / elapsed / (1024.0 * 1024.0),
            country,
            country_code,
            city,
            lat,
            lon,
        }
    }
}

/// `network_capture`: capture pipeline health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub capture_available: bool,
    pub sniffer_running: bool,
    pub sniffer_error: Option<String>,
    pub sniffer_mode: Option<&'static str>,
    pub capture_method: String,
    pub flow_keys: usize,
    pub geo_cached: usize,
    pub geo_inflight: usize,
    pub local_ip_count: usize,
    pub ifaces: Vec<String>,
    pub packet_count: u64,
    pub local_match_count: u64,
    pub ignored_count: u64,
}

impl CaptureStatus {
    pub fn new(
        report: CaptureReport,
        stats: PipelineStats,
        flow_keys: usize,
        geo_cached: usize,
        geo_inflight: usize,
        local_ip_count: usize,
    ) -> Self {
        Self {
            capture_available: report.capture_available,
            sniffer_running: report.sniffer_running,
            sniffer_error: report.sniffer_error,
            sniffer_mode: report.sniffer_mode,
            capture_method: report.capture_method,
            flow_keys,
            geo_cached,
            geo_inflight,
            local_ip_count,
            ifaces: report.ifaces,
            packet_count: stats.packet_count,
            local_match_count: stats.local_match_count,
            ignored_count: stats.ignored_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnergyPayload {
    pub wattage: Option<f64>,
    pub source: Option<&'static str>,
}

impl From<Option<&EnergyReading>> for EnergyPayload {
    fn from(reading: Option<&EnergyReading>) -> Self {
        Self {
            wattage: reading.and_then(|r| r.wattage),
            source: reading.map(|r| r.source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermalPayload {
    pub cpu_temp_c: Option<f64>,
    pub pressure_level: Option<String>,
    pub source: Option<&'static str>,
    pub is_estimated: bool,
}

impl ThermalPayload {
    /// An estimated reading is re-derived every tick from the current load
    pub fn new(reading: Option<&ThermalReading>, cpu_total: f64) -> Self {
        let Some(reading) = reading else {
            return Self {
                cpu_temp_c: None,
                pressure_level: None,
                source: None,
                is_estimated: false,
            };
        };
        let cpu_temp_c = if reading.is_estimated {
            Some(estimate_cpu_temperature(
                reading.pressure_level.as_deref(),
                cpu_total,
            ))
        } else {
            reading.cpu_temp_c
        };
        Self {
            cpu_temp_c,
            pressure_level: reading.pressure_level.clone(),
            source: reading.source,
            is_estimated: reading.is_estimated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryPayload {
    pub health_percent: Option<f64>,
    pub current_capacity: Option<u64>,
    pub design_capacity: Option<u64>,
}

impl From<Option<&BatteryReading>> for BatteryPayload {
    fn from(reading: Option<&BatteryReading>) -> Self {
        Self {
            health_percent: reading.and_then(|r| r.health_percent),
            current_capacity: reading.and_then(|r| r.current_capacity),
            design_capacity: reading.and_then(|r| r.design_capacity),
        }
    }
}
