// In-process datalink capture using pnet

use super::CaptureBackend;
use crate::capture::{CaptureFailure, CaptureShared};
use crate::flows::{FlowAggregator, PacketEvent};
use crate::traffic_classifier::Protocol;
use pnet_datalink::{Channel, DataLinkReceiver, NetworkInterface};
use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Captures directly from the selected interfaces, one reader thread each
pub struct PnetBackend;

impl CaptureBackend for PnetBackend {
    fn name(&self) -> &'static str {
        "pnet"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn start(
        &self,
        interfaces: &[String],
        sink: Arc<FlowAggregator>,
        shared: Arc<CaptureShared>,
    ) -> Result<(), CaptureFailure> {
        let available = pnet_datalink::interfaces();
        let selected: Vec<&NetworkInterface> = interfaces
            .iter()
            .filter_map(|name| available.iter().find(|iface| &iface.name == name))
            .collect();
        if selected.is_empty() {
            return Err(CaptureFailure::NoInterface("pnet"));
        }

        let mut receivers = Vec::new();
        for iface in selected {
            match pnet_datalink::channel(iface, Default::default()) {
                Ok(Channel::Ethernet(_, rx)) => receivers.push((iface.name.clone(), rx)),
                Ok(_) => log::warn!("Unsupported channel type on {}", iface.name),
                Err(e) => log::warn!("Failed to open capture channel on {}: {}", iface.name, e),
            }
        }
        if receivers.is_empty() {
            return Err(CaptureFailure::StartFailed("pnet"));
        }

        for (name, rx) in receivers {
            let sink = Arc::clone(&sink);
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("capture-{}", name))
                .spawn(move || capture_loop(&name, rx, &sink, &shared));
            if let Err(e) = spawned {
                log::warn!("Failed to spawn capture thread: {}", e);
                return Err(CaptureFailure::StartFailed("pnet"));
            }
        }

        Ok(())
    }
}

/// Packet capture thread - runs until the channel breaks
fn capture_loop(
    name: &str,
    mut rx: Box<dyn DataLinkReceiver>,
    sink: &FlowAggregator,
    shared: &CaptureShared,
) {
    let mut seen: u64 = 0;
    let mut consecutive_errors = 0u32;
    loop {
        match rx.next() {
            Ok(frame) => {
                consecutive_errors = 0;
                if let Some(event) = parse_frame(frame) {
                    sink.record(&event);
                    seen += 1;
                    if seen % 1000 == 0 {
                        let stats = sink.stats();
                        log::debug!(
                            "{}: {} packets ({} local, {} ignored), {} flow keys",
                            name,
                            stats.packet_count,
                            stats.local_match_count,
                            stats.ignored_count,
                            sink.key_count()
                        );
                    }
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= 50 {
                    log::warn!("Capture on {} stopped: {}", name, e);
                    shared.mark_exited(format!("pnet-exited: {}", e));
                    return;
                }
                log::debug!("Packet receive error on {}: {}", name, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Ethernet frame to packet event, if it carries IP traffic with payload
pub fn parse_frame(frame: &[u8]) -> Option<PacketEvent> {
    let ethernet = EthernetPacket::new(frame)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet.payload())?;
            transport_event(
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.get_next_level_protocol(),
                ipv4.payload(),
            )
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet.payload())?;
            transport_event(
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.get_next_header(),
                ipv6.payload(),
            )
        }
        _ => None,
    }
}

fn transport_event(
    src_addr: IpAddr,
    dst_addr: IpAddr,
    next: IpNextHeaderProtocol,
    payload: &[u8],
) -> Option<PacketEvent> {
    let (protocol, src_port, dst_port, length) = match next {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(payload)?;
            (Protocol::Tcp, tcp.get_source(), tcp.get_destination(), tcp.payload().len())
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(payload)?;
            (Protocol::Udp, udp.get_source(), udp.get_destination(), udp.payload().len())
        }
        IpNextHeaderProtocols::Icmp | IpNextHeaderProtocols::Icmpv6 => {
            (Protocol::Icmp, 0, 0, payload.len())
        }
        _ => return None,
    };

    if length == 0 {
        return None;
    }

    Some(PacketEvent {
        src_addr,
        src_port,
        dst_addr,
        dst_port,
        protocol,
        length: length as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_packet::ethernet::MutableEthernetPacket;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::tcp::MutableTcpPacket;
    use std::net::Ipv4Addr;

    fn tcp_frame(payload_len: usize) -> Vec<u8> {
        let tcp_len = 20 + payload_len;
        let ip_len = 20 + tcp_len;
        let mut frame = vec![0u8; 14 + ip_len];

        {
            let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut frame[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(ip_len as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(Ipv4Addr::new(10, 0, 0, 5));
            ip.set_destination(Ipv4Addr::new(93, 184, 216, 34));
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut frame[34..]).unwrap();
            tcp.set_source(54321);
            tcp.set_destination(443);
            tcp.set_data_offset(5);
        }
        frame
    }

    #[test]
    fn test_parse_tcp_frame() {
        let event = parse_frame(&tcp_frame(64)).unwrap();
        assert_eq!(event.src_addr, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(event.src_port, 54321);
        assert_eq!(event.dst_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(event.dst_port, 443);
        assert_eq!(event.protocol, Protocol::Tcp);
        assert_eq!(event.length, 64);
    }

    #[test]
    fn test_empty_segment_is_dropped() {
        assert!(parse_frame(&tcp_frame(0)).is_none());
    }

    #[test]
    fn test_non_ip_frame_is_dropped() {
        let mut frame = vec![0u8; 60];
        MutableEthernetPacket::new(&mut frame)
            .unwrap()
            .set_ethertype(EtherTypes::Arp);
        assert!(parse_frame(&frame).is_none());
    }
}
