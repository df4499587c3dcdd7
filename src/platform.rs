//! The host networking stack as seen by the client: link enumeration, raw
//! frame I/O and prefix/route installation.

use std::{io, net::Ipv6Addr, sync::Arc};

use advmac::MacAddr6;
use compact_str::CompactString;
use ipnet::Ipv6Net;
use thiserror::Error;

use crate::wire::frame::{self, ETHERTYPE_IPV6};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("link {0} not found")]
    LinkNotFound(CompactString),
    #[error("{op} failed on {link}: {reason}")]
    Failed {
        op: &'static str,
        link: CompactString,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A network link as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: CompactString,
    pub mtu: u32,
    pub mac: MacAddr6,
    pub loopback: bool,
    pub broadcast: bool,
    pub point_to_point: bool,
    pub carrier: bool,
    /// Link-local address when the platform knows one. Otherwise it is
    /// derived from the MAC.
    pub link_local: Option<Ipv6Addr>,
}

impl LinkInfo {
    pub fn link_local(&self) -> Ipv6Addr {
        self.link_local
            .unwrap_or_else(|| frame::link_local_from_mac(self.mac))
    }
}

/// Which inbound frames a receiver wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiveFilter {
    pub ethertype: u16,
    pub udp_dst_port: Option<u16>,
}

impl ReceiveFilter {
    /// IPv6 UDP to the DHCPv6 client port
    pub const DHCPV6_CLIENT: ReceiveFilter = ReceiveFilter {
        ethertype: ETHERTYPE_IPV6,
        udp_dst_port: Some(crate::CLIENT_PORT),
    };

    /// Cheap pre-filter a platform can apply before calling the handler. The
    /// handler still validates everything it reads.
    pub fn matches(&self, frame: &[u8]) -> bool {
        let Ok(packet) = frame::parse_ipv6(frame) else {
            return false;
        };
        match self.udp_dst_port {
            None => self.ethertype == ETHERTYPE_IPV6,
            Some(port) => {
                packet.next_header == crate::wire::checksum::NEXT_HEADER_UDP
                    && packet.payload.len() >= 4
                    && u16::from_be_bytes([packet.payload[2], packet.payload[3]]) == port
            }
        }
    }
}

/// Called with the receiving link's name and the raw Ethernet frame. May run
/// on any platform thread, concurrently with everything else.
pub type FrameHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixLifetimes {
    pub valid: u32,
    pub preferred: u32,
}

pub trait Platform: Send + Sync {
    /// Every link currently known, with fresh flags and carrier state
    fn links(&self) -> Result<Vec<LinkInfo>, PlatformError>;

    /// Administratively bring a link up
    fn set_link_up(&self, link: &str) -> Result<(), PlatformError>;

    /// Hand a complete Ethernet frame to the link for transmission
    fn transmit(&self, link: &str, frame: &[u8]) -> Result<(), PlatformError>;

    fn register_receiver(
        &self,
        filter: ReceiveFilter,
        handler: FrameHandler,
    ) -> Result<(), PlatformError>;

    /// Stop delivering frames for `filter`. No handler call for it starts
    /// after this returns.
    fn unregister_receiver(&self, filter: ReceiveFilter);

    fn install_prefix(
        &self,
        link: &str,
        prefix: Ipv6Net,
        lifetimes: PrefixLifetimes,
    ) -> Result<(), PlatformError>;

    /// Install `::/0 via gateway dev link` with an infinite lifetime
    fn install_default_route(&self, link: &str, gateway: Ipv6Addr) -> Result<(), PlatformError>;

    /// Give a link back when the client no longer needs it
    fn release_link(&self, _link: &str) {}
}
