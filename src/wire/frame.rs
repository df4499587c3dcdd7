//! Ethernet II + IPv6 framing for the frames this client puts on and takes
//! off the wire.

use std::net::Ipv6Addr;

use advmac::MacAddr6;
use thiserror::Error;

use super::checksum::{
    icmpv6_checksum, pseudo_header_checksum, udp_checksum, NEXT_HEADER_ICMPV6, NEXT_HEADER_UDP,
};

pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

/// Hop limit on every frame we originate. Neighbor Discovery requires 255.
pub const HOP_LIMIT: u8 = 255;

/// ff02::1:2, all DHCP relay agents and servers
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);
/// ff02::1, all nodes
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("ethertype {0:#06x} is not IPv6")]
    NotIpv6(u16),
    #[error("IP version {0}")]
    BadVersion(u8),
    #[error("unexpected next header {0}")]
    UnexpectedNextHeader(u8),
    #[error("length field disagrees with frame")]
    BadLength,
    #[error("checksum mismatch")]
    BadChecksum,
}

/// Ethernet multicast address for an IPv6 multicast group (RFC 2464 7).
pub fn multicast_mac(group: &Ipv6Addr) -> MacAddr6 {
    let o = group.octets();
    MacAddr6::new([0x33, 0x33, o[12], o[13], o[14], o[15]])
}

/// fe80::/64 address with a modified EUI-64 interface id built from `mac`.
pub fn link_local_from_mac(mac: MacAddr6) -> Ipv6Addr {
    let m = mac.to_array();
    Ipv6Addr::new(
        0xfe80,
        0,
        0,
        0,
        (((m[0] ^ 0x02) as u16) << 8) | m[1] as u16,
        ((m[2] as u16) << 8) | 0xff,
        0xfe00 | m[3] as u16,
        ((m[4] as u16) << 8) | m[5] as u16,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Packet<'a> {
    pub src_mac: MacAddr6,
    pub dst_mac: MacAddr6,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_mac: MacAddr6,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

fn mac_at(frame: &[u8], at: usize) -> MacAddr6 {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[at..at + 6]);
    MacAddr6::new(mac)
}

fn addr_at(buf: &[u8], at: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[at..at + 16]);
    Ipv6Addr::from(octets)
}

/// Split an Ethernet frame into its IPv6 header fields and payload.
///
/// Trailing Ethernet padding past the IPv6 payload length is ignored.
/// Extension headers are not walked, so the next header is whatever follows
/// the fixed header.
pub fn parse_ipv6(frame: &[u8]) -> Result<Ipv6Packet<'_>, FrameError> {
    if frame.len() < ETHERNET_HEADER_LEN + IPV6_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV6 {
        return Err(FrameError::NotIpv6(ethertype));
    }
    let ip = &frame[ETHERNET_HEADER_LEN..];
    let version = ip[0] >> 4;
    if version != 6 {
        return Err(FrameError::BadVersion(version));
    }
    let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
    let payload = ip[IPV6_HEADER_LEN..]
        .get(..payload_len)
        .ok_or(FrameError::Truncated)?;

    Ok(Ipv6Packet {
        src_mac: mac_at(frame, 6),
        dst_mac: mac_at(frame, 0),
        src: addr_at(ip, 8),
        dst: addr_at(ip, 24),
        next_header: ip[6],
        hop_limit: ip[7],
        payload,
    })
}

/// Parse an Ethernet/IPv6/UDP frame and verify its checksum.
pub fn parse_udp(frame: &[u8]) -> Result<UdpDatagram<'_>, FrameError> {
    let packet = parse_ipv6(frame)?;
    if packet.next_header != NEXT_HEADER_UDP {
        return Err(FrameError::UnexpectedNextHeader(packet.next_header));
    }
    let segment = packet.payload;
    if segment.len() < UDP_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let udp_len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
        return Err(FrameError::BadLength);
    }
    let segment = &segment[..udp_len];
    // a zero checksum is not allowed over IPv6
    let carried = u16::from_be_bytes([segment[6], segment[7]]);
    if carried == 0 || pseudo_header_checksum(&packet.src, &packet.dst, NEXT_HEADER_UDP, segment) != 0
    {
        return Err(FrameError::BadChecksum);
    }

    Ok(UdpDatagram {
        src_mac: packet.src_mac,
        src: packet.src,
        dst: packet.dst,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        payload: &segment[UDP_HEADER_LEN..],
    })
}

/// Parse an Ethernet/IPv6/ICMPv6 frame and verify its checksum. The returned
/// payload is the ICMPv6 message.
pub fn parse_icmpv6(frame: &[u8]) -> Result<Ipv6Packet<'_>, FrameError> {
    let packet = parse_ipv6(frame)?;
    if packet.next_header != NEXT_HEADER_ICMPV6 {
        return Err(FrameError::UnexpectedNextHeader(packet.next_header));
    }
    if packet.payload.len() < 4 {
        return Err(FrameError::Truncated);
    }
    if icmpv6_checksum(&packet.src, &packet.dst, packet.payload) != 0 {
        return Err(FrameError::BadChecksum);
    }
    Ok(packet)
}

fn push_headers(
    buf: &mut Vec<u8>,
    src_mac: MacAddr6,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    next_header: u8,
    payload_len: usize,
) {
    buf.extend_from_slice(&destination_mac(dst).to_array());
    buf.extend_from_slice(&src_mac.to_array());
    buf.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());

    buf.extend_from_slice(&[0x60, 0, 0, 0]);
    buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
    buf.push(next_header);
    buf.push(HOP_LIMIT);
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
}

// No neighbor cache here: unicast destinations are flooded
fn destination_mac(dst: &Ipv6Addr) -> MacAddr6 {
    if dst.is_multicast() {
        multicast_mac(dst)
    } else {
        MacAddr6::new([0xff; 6])
    }
}

/// Build a complete Ethernet frame carrying `payload` in UDP over IPv6.
pub fn udp_frame(
    src_mac: MacAddr6,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + udp_len);
    push_headers(&mut buf, src_mac, &src, &dst, NEXT_HEADER_UDP, udp_len);

    let udp_start = buf.len();
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);

    let sum = udp_checksum(&src, &dst, &buf[udp_start..]);
    buf[udp_start + 6..udp_start + 8].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// Build a complete Ethernet frame carrying an ICMPv6 `message`, filling in
/// the checksum at bytes 2..4 of the message.
pub fn icmpv6_frame(src_mac: MacAddr6, src: Ipv6Addr, dst: Ipv6Addr, message: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ETHERNET_HEADER_LEN + IPV6_HEADER_LEN + message.len());
    push_headers(&mut buf, src_mac, &src, &dst, NEXT_HEADER_ICMPV6, message.len());

    let start = buf.len();
    buf.extend_from_slice(message);
    buf[start + 2..start + 4].fill(0);
    let sum = icmpv6_checksum(&src, &dst, &buf[start..]);
    buf[start + 2..start + 4].copy_from_slice(&sum.to_be_bytes());
    buf
}
