//! ICMPv6 Router Advertisement (RFC 4861 4.2) with the Source Link-Layer
//! Address and Prefix Information options.

use std::net::Ipv6Addr;

use advmac::MacAddr6;
use ipnet::Ipv6Net;

use super::{DecodeError, Reader};

pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

pub const ND_OPT_SOURCE_LINK_ADDR: u8 = 1;
pub const ND_OPT_PREFIX_INFORMATION: u8 = 3;

const RA_HEADER_LEN: usize = 16;
const PIO_FLAG_ON_LINK: u8 = 0x80;
const PIO_FLAG_AUTONOMOUS: u8 = 0x40;

/// Hop limit advertised for hosts on downstream links
pub const ADVERTISED_HOP_LIMIT: u8 = 64;
/// Router lifetime the announcer asks for. Larger than the 16-bit field, so it
/// is saturated when encoded.
pub const ROUTER_LIFETIME_SECS: u32 = 86_400;
pub const PREFIX_VALID_LIFETIME: u32 = 86_400;
pub const PREFIX_PREFERRED_LIFETIME: u32 = 14_400;

/// Default router preference, RFC 4191 2.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterPreference {
    High,
    #[default]
    Medium,
    Low,
    /// The reserved `10` encoding. Receivers treat it as medium.
    Reserved,
}

impl RouterPreference {
    fn bits(self) -> u8 {
        match self {
            RouterPreference::High => 0b01,
            RouterPreference::Medium => 0b00,
            RouterPreference::Low => 0b11,
            RouterPreference::Reserved => 0b10,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => RouterPreference::High,
            0b00 => RouterPreference::Medium,
            0b11 => RouterPreference::Low,
            _ => RouterPreference::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix: Ipv6Net,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub cur_hop_limit: u8,
    pub managed: bool,
    pub other_config: bool,
    pub preference: RouterPreference,
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub source_link_addr: Option<MacAddr6>,
    pub prefix: Option<PrefixInformation>,
}

/// Clamp a lifetime in seconds into the 16-bit router lifetime field.
pub fn saturate_router_lifetime(secs: u32) -> u16 {
    u16::try_from(secs).unwrap_or(u16::MAX)
}

impl RouterAdvertisement {
    /// The advertisement sent on a downstream link: medium preference, this
    /// router's MAC, and the link's /64 for on-link autoconfiguration.
    pub fn announcement(source_link_addr: MacAddr6, prefix: Ipv6Net) -> Self {
        Self {
            cur_hop_limit: ADVERTISED_HOP_LIMIT,
            managed: false,
            other_config: false,
            preference: RouterPreference::Medium,
            router_lifetime: saturate_router_lifetime(ROUTER_LIFETIME_SECS),
            reachable_time: 0,
            retrans_timer: 0,
            source_link_addr: Some(source_link_addr),
            prefix: Some(PrefixInformation {
                prefix,
                on_link: true,
                autonomous: true,
                valid_lifetime: PREFIX_VALID_LIFETIME,
                preferred_lifetime: PREFIX_PREFERRED_LIFETIME,
            }),
        }
    }

    /// Encode with a zero checksum; framing fills it in.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RA_HEADER_LEN + 8 + 32);
        buf.push(ICMPV6_ROUTER_ADVERTISEMENT);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]);
        buf.push(self.cur_hop_limit);
        let mut flags = self.preference.bits() << 3;
        if self.managed {
            flags |= 0x80;
        }
        if self.other_config {
            flags |= 0x40;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.router_lifetime.to_be_bytes());
        buf.extend_from_slice(&self.reachable_time.to_be_bytes());
        buf.extend_from_slice(&self.retrans_timer.to_be_bytes());

        if let Some(mac) = self.source_link_addr {
            buf.push(ND_OPT_SOURCE_LINK_ADDR);
            buf.push(1);
            buf.extend_from_slice(&mac.to_array());
        }
        if let Some(pio) = &self.prefix {
            buf.push(ND_OPT_PREFIX_INFORMATION);
            buf.push(4);
            buf.push(pio.prefix.prefix_len());
            let mut flags = 0u8;
            if pio.on_link {
                flags |= PIO_FLAG_ON_LINK;
            }
            if pio.autonomous {
                flags |= PIO_FLAG_AUTONOMOUS;
            }
            buf.push(flags);
            buf.extend_from_slice(&pio.valid_lifetime.to_be_bytes());
            buf.extend_from_slice(&pio.preferred_lifetime.to_be_bytes());
            buf.extend_from_slice(&[0; 4]);
            buf.extend_from_slice(&pio.prefix.network().octets());
        }
        buf
    }

    /// Decode an RA. The checksum is not verified here.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let msg_type = r.u8()?;
        if msg_type != ICMPV6_ROUTER_ADVERTISEMENT {
            return Err(DecodeError::UnknownMessageType(msg_type));
        }
        let _code = r.u8()?;
        let _checksum = r.u16()?;
        let cur_hop_limit = r.u8()?;
        let flags = r.u8()?;
        let mut ra = Self {
            cur_hop_limit,
            managed: flags & 0x80 != 0,
            other_config: flags & 0x40 != 0,
            preference: RouterPreference::from_bits(flags >> 3),
            router_lifetime: r.u16()?,
            reachable_time: r.u32()?,
            retrans_timer: r.u32()?,
            source_link_addr: None,
            prefix: None,
        };

        while !r.is_empty() {
            let opt_type = r.u8()?;
            let units = r.u8()?;
            if units == 0 {
                return Err(DecodeError::LengthMismatch {
                    code: opt_type as u16,
                    len: 0,
                });
            }
            // length counts 8 octet units including the 2 byte header
            let mut body = Reader::new(r.slice(units as usize * 8 - 2)?);
            match opt_type {
                ND_OPT_SOURCE_LINK_ADDR if ra.source_link_addr.is_none() => {
                    ra.source_link_addr = Some(MacAddr6::new(body.array::<6>()?));
                }
                ND_OPT_PREFIX_INFORMATION if ra.prefix.is_none() => {
                    if units != 4 {
                        return Err(DecodeError::LengthMismatch {
                            code: opt_type as u16,
                            len: units as u16 * 8,
                        });
                    }
                    let prefix_len = body.u8()?;
                    let flags = body.u8()?;
                    let valid_lifetime = body.u32()?;
                    let preferred_lifetime = body.u32()?;
                    let _reserved = body.u32()?;
                    let addr = Ipv6Addr::from(body.array::<16>()?);
                    let prefix = Ipv6Net::new(addr, prefix_len)
                        .map_err(|_| DecodeError::InvalidPrefixLength(prefix_len))?;
                    ra.prefix = Some(PrefixInformation {
                        prefix,
                        on_link: flags & PIO_FLAG_ON_LINK != 0,
                        autonomous: flags & PIO_FLAG_AUTONOMOUS != 0,
                        valid_lifetime,
                        preferred_lifetime,
                    });
                }
                _ => {}
            }
        }
        Ok(ra)
    }
}
