// Connection table - maps a live transport 4-tuple to its owning process

use crate::backends::socket_mapper::{ConnectionRecord, SocketMapperBackend, select_socket_mapper};
use crate::traffic_classifier::Protocol;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

pub const UNKNOWN_PROCESS: &str = "unknown";

/// Connection identifier, always oriented local -> remote
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

impl From<&ConnectionRecord> for ConnectionKey {
    fn from(record: &ConnectionRecord) -> Self {
        Self {
            protocol: record.protocol,
            local_addr: record.local_addr,
            local_port: record.local_port,
            remote_addr: record.remote_addr,
            remote_port: record.remote_port,
        }
    }
}

type ConnectionMap = HashMap<ConnectionKey, Arc<str>>;

/// Process ownership of every connected socket, rebuilt wholesale
///
/// The table may be a few seconds stale; lookups for connections that have
/// come and gone since the last rebuild simply return "unknown".
pub struct ConnectionTable {
    mapper: Option<Box<dyn SocketMapperBackend>>,
    map: Mutex<Arc<ConnectionMap>>,
    unknown: Arc<str>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        let mapper = match select_socket_mapper() {
            Ok(mapper) => {
                log::debug!("Using socket mapper backend: {}", mapper.name());
                Some(mapper)
            }
            Err(e) => {
                log::warn!("Process attribution unavailable: {}", e);
                None
            }
        };
        Self::with_mapper(mapper)
    }

    pub fn with_mapper(mapper: Option<Box<dyn SocketMapperBackend>>) -> Self {
        Self {
            mapper,
            map: Mutex::new(Arc::new(HashMap::new())),
            unknown: Arc::from(UNKNOWN_PROCESS),
        }
    }

    /// Enumerate connections and atomically replace the table
    ///
    /// Blocking: walks /proc or runs lsof. An enumeration failure keeps the
    /// previous table.
    pub fn refresh(&self) {
        let Some(mapper) = &self.mapper else {
            return;
        };
        match mapper.connections() {
            Ok(records) => self.replace(records),
            Err(e) => log::warn!("Connection enumeration via {} failed: {}", mapper.name(), e),
        }
    }

    /// Build a fresh map off-lock, then swap it in
    pub fn replace(&self, records: Vec<ConnectionRecord>) {
        let mut names: HashMap<String, Arc<str>> = HashMap::new();
        let mut next = ConnectionMap::with_capacity(records.len());
        for record in &records {
            let name = names
                .entry(record.process_name.clone())
                .or_insert_with(|| Arc::from(record.process_name.as_str()))
                .clone();
            next.insert(ConnectionKey::from(record), name);
        }

        log::debug!("Updating connection table: {} connections", next.len());
        *self.map.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    /// Owning process name, or "unknown" on miss
    pub fn lookup(&self, key: &ConnectionKey) -> Arc<str> {
        let map = Arc::clone(&self.map.lock().unwrap_or_else(|e| e.into_inner()));
        map.get(key).cloned().unwrap_or_else(|| Arc::clone(&self.unknown))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
