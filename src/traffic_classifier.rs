//! Address classification utilities
//!
//! Normalizes textual addresses coming from capture tools and connection
//! enumerators, and decides which remote endpoints are worth geolocating.
//! Every component uses these helpers so that an address compares equal no
//! matter which tool reported it.

use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "ICMP")]
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an address string into a canonical `IpAddr`
///
/// Strips any `%zone` scope suffix (e.g. `fe80::1%en0`) and surrounding
/// brackets. IPv4-mapped IPv6 addresses are folded to plain IPv4 so that
/// dual-stack sockets match the addresses seen on the wire.
pub fn normalize_ip(address: &str) -> Option<IpAddr> {
    let candidate = address
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']');
    let candidate = candidate.split('%').next().unwrap_or(candidate);
    let ip: IpAddr = candidate.parse().ok()?;
    Some(canonical(ip))
}

/// Fold IPv4-mapped IPv6 (`::ffff:a.b.c.d`) into IPv4
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Determines if an IP address is globally routable and may be sent to a
/// geolocation provider
///
/// Rejects private, loopback, link-local, multicast, reserved, unspecified,
/// broadcast, documentation and shared (CGNAT) ranges.
pub fn is_geolocatable(ip: &IpAddr) -> bool {
    match canonical(*ip) {
        IpAddr::V4(ipv4) => !is_non_global_ipv4(&ipv4),
        IpAddr::V6(ipv6) => !is_non_global_ipv6(&ipv6),
    }
}

fn is_non_global_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()           // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_loopback()   // 127.0.0.0/8
        || ip.is_link_local() // 169.254.0.0/16
        || ip.is_multicast()  // 224.0.0.0/4
        || ip.is_broadcast()  // 255.255.255.255
        || ip.is_documentation()
        || ip.is_unspecified()
        || octets[0] == 0 // "this network"
        || octets[0] >= 240 // 240.0.0.0/4 reserved
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // 100.64.0.0/10 shared
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18) // 198.18.0.0/15 benchmarking
}

fn is_non_global_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || ip.is_unicast_link_local() // fe80::/10
        || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (first == 0x2001 && ip.segments()[1] == 0x0db8) // documentation
        || (first & 0xe000) != 0x2000 // outside 2000::/3 global unicast
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_normalize_strips_zone() {
        assert_eq!(normalize_ip("fe80::1%en0"), Some(ip("fe80::1")));
        assert_eq!(normalize_ip(" 10.0.0.5 "), Some(ip("10.0.0.5")));
        assert_eq!(normalize_ip("[2001:db8::1]"), Some(ip("2001:db8::1")));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert_eq!(normalize_ip("10.0.0"), None);
        assert_eq!(normalize_ip("not-an-ip"), None);
        assert_eq!(normalize_ip(""), None);
    }

    #[test]
    fn test_normalize_folds_mapped_ipv4() {
        assert_eq!(normalize_ip("::ffff:93.184.216.34"), Some(ip("93.184.216.34")));
    }

    #[test]
    fn test_private_ranges_not_geolocatable() {
        for addr in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "224.0.0.251",
            "239.255.255.250",
            "255.255.255.255",
            "240.0.0.1",
            "100.64.0.1",
            "0.0.0.0",
        ] {
            assert!(!is_geolocatable(&ip(addr)), "{addr} should be excluded");
        }
    }

    #[test]
    fn test_ipv6_local_not_geolocatable() {
        for addr in ["::1", "::", "fe80::1", "fd00::1", "ff02::fb", "2001:db8::1"] {
            assert!(!is_geolocatable(&ip(addr)), "{addr} should be excluded");
        }
    }

    #[test]
    fn test_public_addresses_geolocatable() {
        for addr in [
            "8.8.8.8",
            "93.184.216.34",
            "140.82.112.4",
            "2001:4860:4860::8888",
            "2606:4700:4700::1111",
        ] {
            assert!(is_geolocatable(&ip(addr)), "{addr} should be routable");
        }
    }
}
