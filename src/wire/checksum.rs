use std::net::Ipv6Addr;

pub const NEXT_HEADER_UDP: u8 = 17;
pub const NEXT_HEADER_ICMPV6: u8 = 58;

/// One's complement sum of `data` as big-endian 16-bit words, added to `sum`.
/// An odd trailing byte is padded with a zero low byte.
fn add_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        sum = fold_carry(sum);
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum += (byte as u32) << 8;
    }
    fold_carry(sum)
}

fn fold_carry(mut sum: u32) -> u32 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

/// RFC 1071 internet checksum of a contiguous buffer.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !(add_words(0, data) as u16)
}

/// Upper-layer checksum over the IPv6 pseudo-header (RFC 8200 8.1) followed by
/// `payload`.
///
/// The checksum field inside `payload` must be zero when computing, and is
/// left in place when verifying: a correct packet then sums to zero.
pub fn pseudo_header_checksum(
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    next_header: u8,
    payload: &[u8],
) -> u16 {
    let len = payload.len() as u32;
    let mut sum = add_words(0, &src.octets());
    sum = add_words(sum, &dst.octets());
    sum = add_words(sum, &len.to_be_bytes());
    sum = add_words(sum, &[0, 0, 0, next_header]);
    sum = add_words(sum, payload);
    !(sum as u16)
}

/// Checksum to place in a UDP header. Zero means "no checksum" on the wire,
/// which IPv6 forbids, so it is sent as all ones.
pub fn udp_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, segment: &[u8]) -> u16 {
    match pseudo_header_checksum(src, dst, NEXT_HEADER_UDP, segment) {
        0 => 0xffff,
        c => c,
    }
}

pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, message: &[u8]) -> u16 {
    pseudo_header_checksum(src, dst, NEXT_HEADER_ICMPV6, message)
}
