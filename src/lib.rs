use std::{
    fmt,
    net::Ipv6Addr,
    time::{SystemTime, UNIX_EPOCH},
};

use advmac::MacAddr6;
use compact_str::CompactString;
use ipnet::Ipv6Net;
use rand::RngCore;
use serde::Serialize;

pub mod announcer;
pub mod client;
pub mod config;
pub mod context;
pub mod correlator;
pub mod distributor;
pub mod error;
pub mod exchange;
pub mod logging;
pub mod platform;
pub mod registry;
#[cfg(unix)]
pub mod signal;
pub mod wire;

#[cfg(test)]
mod testutil;

pub use client::Danir;
pub use config::Config;
pub use context::Context;
pub use error::Error;
pub use platform::{LinkInfo, Platform, PlatformError};

/// DHCPv6 client port
pub const CLIENT_PORT: u16 = 546;
/// DHCPv6 server and relay agent port
pub const SERVER_PORT: u16 = 547;

/// Renewal time requested in every IA_PD. Never derived from server hints.
pub const IA_PD_T1: u32 = 3600;
/// Rebinding time requested in every IA_PD
pub const IA_PD_T2: u32 = 5400;

/// Prefix length handed to downstream links, whatever the server delegated
pub const USABLE_PREFIX_LEN: u8 = 64;

/// Seconds between the unix epoch and 2000-01-01T00:00:00Z, the DUID-LLT epoch
const DUID_EPOCH_OFFSET: u64 = 946_684_800;

/// DHCPv6 transaction id, 3 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Xid(pub [u8; 3]);

impl Xid {
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 3];
        rng.fill_bytes(&mut bytes);
        Xid(bytes)
    }

    pub fn as_bytes(&self) -> [u8; 3] {
        self.0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

impl From<[u8; 3]> for Xid {
    fn from(value: [u8; 3]) -> Self {
        Xid(value)
    }
}

/// Link-layer address plus time DUID, the only DUID form this client speaks.
///
/// `duid_type` and `hw_type` are kept as received so a server that sends a
/// different type with the same 14 byte option length still round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Duid {
    pub duid_type: u16,
    pub hw_type: u16,
    pub time: u32,
    pub link_addr: MacAddr6,
}

impl Duid {
    /// Encoded length of the DUID inside a Client/Server Identifier option
    pub const LEN: usize = 14;
    pub const TYPE_LLT: u16 = 1;
    pub const HW_ETHERNET: u16 = 1;

    pub fn link_layer_time(link_addr: MacAddr6, time: u32) -> Self {
        Self {
            duid_type: Self::TYPE_LLT,
            hw_type: Self::HW_ETHERNET,
            time,
            link_addr,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.duid_type.to_be_bytes());
        out[2..4].copy_from_slice(&self.hw_type.to_be_bytes());
        out[4..8].copy_from_slice(&self.time.to_be_bytes());
        out[8..14].copy_from_slice(&self.link_addr.to_array());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[8..14]);
        Self {
            duid_type: u16::from_be_bytes([bytes[0], bytes[1]]),
            hw_type: u16::from_be_bytes([bytes[2], bytes[3]]),
            time: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            link_addr: MacAddr6::new(mac),
        }
    }

    /// Format the DUID as colon separated hex, for logging
    pub fn to_colon_string(&self) -> String {
        self.to_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// IAID used for the IA_PD sent on a link: the low three octets of its MAC.
pub fn iaid_for(mac: MacAddr6) -> [u8; 4] {
    let m = mac.to_array();
    [0, m[3], m[4], m[5]]
}

/// Contents of an IA_PREFIX option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelegatedPrefix {
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub prefix_len: u8,
    pub prefix: Ipv6Addr,
}

impl DelegatedPrefix {
    /// The delegated prefix cut to the /64 this client distributes.
    pub fn usable(&self) -> Ipv6Net {
        // USABLE_PREFIX_LEN is a valid length so new() cannot fail
        Ipv6Net::new(self.prefix, USABLE_PREFIX_LEN)
            .map(|net| net.trunc())
            .unwrap_or_else(|_| Ipv6Net::from(self.prefix))
    }
}

/// Negotiated lease as it is being assembled by the receive path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseState {
    pub server_id: Option<Duid>,
    pub server_link_addr: Option<MacAddr6>,
    /// IPv6 source of the Reply, used as the default gateway
    pub server_addr: Option<Ipv6Addr>,
    pub prefix: Option<DelegatedPrefix>,
}

impl LeaseState {
    pub fn clear(&mut self) {
        *self = LeaseState::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == LeaseState::default()
    }

    /// Freeze a complete state into a [`Lease`] bound to the winning link.
    pub fn freeze(&self, link: &str) -> Option<Lease> {
        Some(Lease {
            link: CompactString::from(link),
            server_id: self.server_id?,
            server_link_addr: self.server_link_addr?,
            server_addr: self.server_addr?,
            prefix: self.prefix?,
        })
    }
}

/// A completed, immutable lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub link: CompactString,
    pub server_id: Duid,
    pub server_link_addr: MacAddr6,
    pub server_addr: Ipv6Addr,
    pub prefix: DelegatedPrefix,
}

/// Seconds since 2000-01-01T00:00:00Z for the current wall clock.
pub fn duid_time_now() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(DUID_EPOCH_OFFSET);
    u32::try_from(secs.saturating_sub(DUID_EPOCH_OFFSET)).unwrap_or(u32::MAX)
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Derive a DUID time from a kernel style build string such as
/// `#1 SMP PREEMPT_DYNAMIC Thu Sep 19 10:23:41 UTC 2019`.
///
/// Looks for `<Mon> <day> <hh:mm:ss> <zone> <year>` anywhere in the string.
/// Returns `None` when no such sequence is present or the date predates 2000.
pub fn duid_time_from_version(version: &str) -> Option<u32> {
    let tokens: Vec<&str> = version.split_whitespace().collect();
    tokens.windows(5).find_map(|w| {
        let month = MONTHS.iter().position(|m| *m == w[0])? as i64 + 1;
        let day: i64 = w[1].parse().ok()?;
        let mut hms = w[2].split(':').map(|p| p.parse::<i64>().ok());
        let (h, m, s) = (hms.next()??, hms.next()??, hms.next()??);
        if hms.next().is_some() {
            return None;
        }
        let year: i64 = w[4].parse().ok()?;
        if !(1..=31).contains(&day) || !(0..24).contains(&h) || !(0..60).contains(&m) {
            return None;
        }
        if !(0..61).contains(&s) {
            return None;
        }
        let days = days_from_civil(year, month, day) - days_from_civil(2000, 1, 1);
        let secs = days * 86_400 + h * 3600 + m * 60 + s;
        u32::try_from(secs).ok()
    })
}

// days since 1970-01-01 in the proleptic gregorian calendar
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_display_is_hex() {
        assert_eq!(Xid([0x0a, 0xbc, 0x01]).to_string(), "0abc01");
    }

    #[test]
    fn duid_bytes_layout() {
        let duid = Duid::link_layer_time(MacAddr6::new([0, 1, 2, 3, 4, 5]), 0x01020304);
        let bytes = duid.to_bytes();
        assert_eq!(bytes, [0, 1, 0, 1, 1, 2, 3, 4, 0, 1, 2, 3, 4, 5]);
        assert_eq!(Duid::from_bytes(&bytes), duid);
        assert_eq!(duid.to_colon_string(), "00:01:00:01:01:02:03:04:00:01:02:03:04:05");
    }

    #[test]
    fn iaid_uses_low_mac_octets() {
        let mac = MacAddr6::new([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(iaid_for(mac), [0, 0xab, 0xcd, 0xef]);
    }

    #[test]
    fn usable_prefix_is_always_64() {
        let delegated = DelegatedPrefix {
            preferred_lifetime: 1,
            valid_lifetime: 2,
            prefix_len: 56,
            prefix: "2001:db8:1:ff00::".parse().unwrap(),
        };
        assert_eq!(delegated.usable(), "2001:db8:1:ff00::/64".parse::<Ipv6Net>().unwrap());

        let noisy = DelegatedPrefix {
            prefix_len: 48,
            prefix: "2001:db8:1:2:3:4:5:6".parse().unwrap(),
            ..delegated
        };
        assert_eq!(noisy.usable(), "2001:db8:1:2::/64".parse::<Ipv6Net>().unwrap());
    }

    #[test]
    fn duid_epoch_is_midnight_2000() {
        assert_eq!(days_from_civil(2000, 1, 1) * 86_400, DUID_EPOCH_OFFSET as i64);
        assert_eq!(
            duid_time_from_version("Sat Jan 1 00:00:00 UTC 2000"),
            Some(0),
            "the epoch itself is zero"
        );
    }

    #[test]
    fn duid_time_from_kernel_version() {
        let version = "#1 SMP PREEMPT_DYNAMIC Thu Sep 19 10:23:41 UTC 2019";
        // 2019-09-19T10:23:41Z is unix 1568888621
        assert_eq!(
            duid_time_from_version(version),
            Some((1_568_888_621 - DUID_EPOCH_OFFSET) as u32)
        );
    }

    #[test]
    fn duid_time_leap_day() {
        // 2024-02-29T12:00:00Z is unix 1709208000
        assert_eq!(
            duid_time_from_version("Thu Feb 29 12:00:00 UTC 2024"),
            Some((1_709_208_000 - DUID_EPOCH_OFFSET) as u32)
        );
    }

    #[test]
    fn duid_time_rejects_garbage() {
        assert_eq!(duid_time_from_version(""), None);
        assert_eq!(duid_time_from_version("#1 SMP"), None);
        assert_eq!(duid_time_from_version("Foo Sep 19 10:23:41 UTC 2019"), None);
        assert_eq!(duid_time_from_version("Sep 19 10:23 UTC 2019"), None);
        assert_eq!(
            duid_time_from_version("Fri Dec 31 23:59:59 UTC 1999"),
            None,
            "dates before the DUID epoch have no representation"
        );
    }

    #[test]
    fn duid_time_now_is_after_2020() {
        // 2020-01-01 is 631152000 seconds after the DUID epoch
        assert!(duid_time_now() > 631_152_000);
    }

    #[test]
    fn freeze_requires_every_field() {
        let mut state = LeaseState::default();
        assert!(state.is_empty());
        assert!(state.freeze("eth0").is_none());

        let duid = Duid::link_layer_time(MacAddr6::new([2, 0, 0, 0, 0, 1]), 7);
        state.server_id = Some(duid);
        state.server_link_addr = Some(duid.link_addr);
        state.prefix = Some(DelegatedPrefix {
            preferred_lifetime: 10,
            valid_lifetime: 20,
            prefix_len: 56,
            prefix: "2001:db8:1::".parse().unwrap(),
        });
        assert!(state.freeze("eth0").is_none(), "server address still missing");

        state.server_addr = Some("fe80::1".parse().unwrap());
        let lease = state.freeze("eth0").expect("complete lease");
        assert_eq!(lease.link, "eth0");
        assert_eq!(lease.server_addr, "fe80::1".parse::<Ipv6Addr>().unwrap());

        state.clear();
        assert!(state.is_empty());
    }

    #[test]
    fn lease_serializes_to_json() {
        let duid = Duid::link_layer_time(MacAddr6::new([2, 0, 0, 0, 0, 1]), 7);
        let lease = Lease {
            link: "wan".into(),
            server_id: duid,
            server_link_addr: duid.link_addr,
            server_addr: "fe80::1".parse().unwrap(),
            prefix: DelegatedPrefix {
                preferred_lifetime: 10,
                valid_lifetime: 20,
                prefix_len: 56,
                prefix: "2001:db8:1::".parse().unwrap(),
            },
        };
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["link"], "wan");
        assert_eq!(json["server_addr"], "fe80::1");
        assert_eq!(json["prefix"]["prefix_len"], 56);
    }
}
