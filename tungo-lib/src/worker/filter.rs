use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

const IPV4_MIN_HEADER: usize = 20;
const IPV4_SRC_OFF: usize = 12;
const IPV4_DST_OFF: usize = 16;

const IPV6_MIN_HEADER: usize = 40;
const IPV6_SRC_OFF: usize = 8;
const IPV6_DST_OFF: usize = 24;

/// Parse the source address out of a raw IP packet header.
pub fn source_ip(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_SRC_OFF, IPV6_SRC_OFF)
}

/// Parse the destination address out of a raw IP packet header.
pub fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    address_at(packet, IPV4_DST_OFF, IPV6_DST_OFF)
}

fn address_at(packet: &[u8], v4_off: usize, v6_off: usize) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_MIN_HEADER => {
            let octets: [u8; 4] = packet[v4_off..v4_off + 4].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= IPV6_MIN_HEADER => {
            let octets: [u8; 16] = packet[v6_off..v6_off + 16].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Check a packet's source against the egress allowlist. An empty
/// allowlist denies everything; unparsable packets are never allowed.
pub fn is_source_allowed(packet: &[u8], allowlist: &[IpNet]) -> bool {
    match source_ip(packet) {
        Some(src) => allowlist.iter().any(|net| net.contains(&src)),
        None => false,
    }
}
