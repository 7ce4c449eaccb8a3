// Local address registry - the set of IPs that belong to this host

use crate::traffic_classifier::normalize_ip;
use pnet_datalink::NetworkInterface;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

/// Immutable snapshot of the host's addresses
pub type LocalAddressSet = Arc<HashSet<IpAddr>>;

/// Tracks the host's current local IP addresses
///
/// Readers take an `Arc` snapshot and never observe a half-built set; a
/// refresh builds the new set off-lock and swaps the pointer.
pub struct AddressRegistry {
    current: Mutex<LocalAddressSet>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(with_loopback(HashSet::new()))),
        }
    }

    /// Build a registry seeded with a fixed set (loopback is always added)
    #[cfg(test)]
    pub fn with_addresses(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let registry = Self::new();
        registry.replace(addrs.into_iter().collect());
        registry
    }

    /// Re-enumerate interface addresses and swap them in
    pub fn refresh(&self) {
        let interfaces = pnet_datalink::interfaces();
        if interfaces.is_empty() {
            log::debug!("Interface enumeration returned nothing, keeping previous addresses");
            return;
        }
        self.replace(addresses_of(&interfaces));
    }

    fn replace(&self, addrs: HashSet<IpAddr>) {
        let next = Arc::new(with_loopback(addrs));
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        log::debug!("Local address set refreshed: {} addresses", next.len());
        *current = next;
    }

    pub fn snapshot(&self) -> LocalAddressSet {
        Arc::clone(&self.current.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }
}

impl Default for AddressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn addresses_of(interfaces: &[NetworkInterface]) -> HashSet<IpAddr> {
    interfaces
        .iter()
        .flat_map(|iface| iface.ips.iter())
        .filter_map(|network| normalize_ip(&network.ip().to_string()))
        .collect()
}

fn with_loopback(mut addrs: HashSet<IpAddr>) -> HashSet<IpAddr> {
    addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    addrs.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
    addrs
}
