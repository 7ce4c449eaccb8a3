//! Flow aggregation
//!
//! Packet events are classified against the local address set, attributed
//! to a process via the connection table, and summed into cumulative byte
//! counters keyed by (direction, remote address, protocol, process). Ports
//! are deliberately not part of the key.
//!
//! Sessions read the table as point-in-time snapshots and diff consecutive
//! snapshots to get per-tick deltas.

use crate::addresses::AddressRegistry;
use crate::connections::{ConnectionKey, ConnectionTable};
use crate::traffic_classifier::{Protocol, canonical};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A single captured packet, already parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEvent {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Payload bytes, always > 0 for events produced by the parsers
    pub length: u64,
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Aggregation identity of a flow
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub direction: Direction,
    pub remote_addr: IpAddr,
    pub protocol: Protocol,
    pub process_name: Arc<str>,
}

/// Cumulative total of one key as seen in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTotal {
    pub bytes: u64,
    /// Changes whenever the key is evicted and re-created, so a new counter
    /// is never diffed against the old one's total
    pub generation: u64,
}

/// Positive byte increment of one key between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowDelta {
    pub key: FlowKey,
    pub bytes: u64,
}

/// Packet pipeline counters for the status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub packet_count: u64,
    pub local_match_count: u64,
    pub ignored_count: u64,
}

struct FlowCounter {
    bytes: u64,
    generation: u64,
    last_touch: u64,
}

struct FlowTable {
    counters: HashMap<FlowKey, FlowCounter>,
    /// 0 = unbounded
    max_keys: usize,
    next_generation: u64,
    clock: u64,
    evicted: u64,
}

impl FlowTable {
    fn add(&mut self, key: FlowKey, bytes: u64) {
        self.clock += 1;
        let clock = self.clock;

        if let Some(counter) = self.counters.get_mut(&key) {
            counter.bytes = counter.bytes.saturating_add(bytes);
            counter.last_touch = clock;
            return;
        }

        if self.max_keys > 0 && self.counters.len() >= self.max_keys {
            self.evict_least_recent();
        }

        self.next_generation += 1;
        self.counters.insert(
            key,
            FlowCounter {
                bytes,
                generation: self.next_generation,
                last_touch: clock,
            },
        );
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .counters
            .iter()
            .min_by_key(|(_, counter)| counter.last_touch)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.counters.remove(&key);
            self.evicted += 1;
            if self.evicted % 1000 == 1 {
                log::debug!(
                    "Flow table at capacity ({}), evicted {} keys so far",
                    self.max_keys,
                    self.evicted
                );
            }
        }
    }
}

/// Consumes packet events and maintains per-flow byte counters
pub struct FlowAggregator {
    addresses: Arc<AddressRegistry>,
    connections: Arc<ConnectionTable>,
    table: Mutex<FlowTable>,
    packet_count: AtomicU64,
    local_match_count: AtomicU64,
    ignored_count: AtomicU64,
}

impl FlowAggregator {
    pub fn new(
        addresses: Arc<AddressRegistry>,
        connections: Arc<ConnectionTable>,
        max_keys: usize,
    ) -> Self {
        Self {
            addresses,
            connections,
            table: Mutex::new(FlowTable {
                counters: HashMap::new(),
                max_keys,
                next_generation: 0,
                clock: 0,
                evicted: 0,
            }),
            packet_count: AtomicU64::new(0),
            local_match_count: AtomicU64::new(0),
            ignored_count: AtomicU64::new(0),
        }
    }

    /// Classify and account one packet
    ///
    /// Returns the key the bytes were added to, or `None` when the packet
    /// was local-to-local or remote-to-remote. Never blocks on I/O.
    pub fn record(&self, event: &PacketEvent) -> Option<FlowKey> {
        let locals = self.addresses.snapshot();
        let captured = self.packet_count.fetch_add(1, Ordering::Relaxed) + 1;

        let src_addr = canonical(event.src_addr);
        let dst_addr = canonical(event.dst_addr);
        let src_local = locals.contains(&src_addr);
        let dst_local = locals.contains(&dst_addr);

        let (direction, connection) = match (src_local, dst_local) {
            (true, false) => (
                Direction::Outbound,
                ConnectionKey {
                    protocol: event.protocol,
                    local_addr: src_addr,
                    local_port: event.src_port,
                    remote_addr: dst_addr,
                    remote_port: event.dst_port,
                },
            ),
            (false, true) => (
                Direction::Inbound,
                ConnectionKey {
                    protocol: event.protocol,
                    local_addr: dst_addr,
                    local_port: event.dst_port,
                    remote_addr: src_addr,
                    remote_port: event.src_port,
                },
            ),
            _ => {
                self.ignored_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let matched = self.local_match_count.fetch_add(1, Ordering::Relaxed) + 1;

        let key = FlowKey {
            direction,
            remote_addr: connection.remote_addr,
            protocol: event.protocol,
            process_name: self.connections.lookup(&connection),
        };

        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(key.clone(), event.length);

        if captured % 1000 == 0 {
            log::debug!(
                "Packet stats: captured={}, classified={} (match rate: {:.1}%)",
                captured,
                matched,
                (matched as f64 / captured as f64) * 100.0
            );
        }

        Some(key)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> FlowSnapshot {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        FlowSnapshot {
            totals: table
                .counters
                .iter()
                .map(|(key, counter)| {
                    (
                        key.clone(),
                        FlowTotal {
                            bytes: counter.bytes,
                            generation: counter.generation,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .len()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            packet_count: self.packet_count.load(Ordering::Relaxed),
            local_match_count: self.local_match_count.load(Ordering::Relaxed),
            ignored_count: self.ignored_count.load(Ordering::Relaxed),
        }
    }
}

/// Immutable copy of the flow counters at one instant
#[derive(Debug, Clone, Default)]
pub struct FlowSnapshot {
    totals: HashMap<FlowKey, FlowTotal>,
}

impl FlowSnapshot {
    #[cfg(test)]
    pub fn insert(&mut self, key: FlowKey, total: FlowTotal) {
        self.totals.insert(key, total);
    }

    #[cfg(test)]
    pub fn get(&self, key: &FlowKey) -> Option<FlowTotal> {
        self.totals.get(key).copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.totals.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Byte increments since `previous`
    ///
    /// A counter that went backwards (reset, or evicted and re-created under
    /// the same generation) contributes zero, never a negative value. Keys
    /// without a positive increment are omitted.
    pub fn deltas_since(&self, previous: &FlowSnapshot) -> Vec<FlowDelta> {
        self.totals
            .iter()
            .filter_map(|(key, current)| {
                let baseline = previous
                    .totals
                    .get(key)
                    .filter(|prev| prev.generation == current.generation)
                    .map_or(0, |prev| prev.bytes);
                let bytes = current.bytes.saturating_sub(baseline);
                (bytes > 0).then(|| FlowDelta {
                    key: key.clone(),
                    bytes,
                })
            })
            .collect()
    }
}

/// Largest `limit` deltas, descending by bytes
pub fn top_flows(mut deltas: Vec<FlowDelta>, limit: usize) -> Vec<FlowDelta> {
    deltas.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| a.key.remote_addr.cmp(&b.key.remote_addr))
    });
    deltas.truncate(limit);
    deltas
}
