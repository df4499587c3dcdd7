//! Splits the delegated prefix across downstream links and installs the
//! default route toward the delegating server.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{error, info, warn};

use crate::{
    context::Context,
    platform::{LinkInfo, PrefixLifetimes},
    registry::LinkCandidate,
    Lease, USABLE_PREFIX_LEN,
};

/// Most downstream links one delegated /64 can be split across
pub const MAX_DOWNSTREAM_LINKS: usize = 255;

/// Octet of the /64 that is bumped per downstream link
const SUBNET_OCTET: usize = 7;

/// `delegated` with its subnet octet advanced by `k`, wrapping mod 256.
pub fn sub_prefix(delegated: Ipv6Net, k: u8) -> Ipv6Net {
    let mut octets = delegated.network().octets();
    octets[SUBNET_OCTET] = octets[SUBNET_OCTET].wrapping_add(k);
    Ipv6Net::new(Ipv6Addr::from(octets), USABLE_PREFIX_LEN)
        .map(|net| net.trunc())
        .unwrap_or(delegated)
}

/// Sub-prefixes for `count` downstream links, in order. Never more than
/// [`MAX_DOWNSTREAM_LINKS`], and none equal to `delegated` itself.
pub fn allocate(delegated: Ipv6Net, count: usize) -> Vec<Ipv6Net> {
    (1..=count.min(MAX_DOWNSTREAM_LINKS))
        .map(|k| sub_prefix(delegated, k as u8))
        .collect()
}

/// A downstream link and the prefix installed on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub link: LinkInfo,
    pub prefix: Ipv6Net,
}

/// Install a sub-prefix on every open link except the winner, then the
/// default route on the winner. Platform failures are logged and the link is
/// left without an assignment.
pub fn distribute(
    ctx: &Context,
    links: &[LinkCandidate],
    winner: usize,
    lease: &Lease,
) -> Vec<Assignment> {
    let delegated = lease.prefix.usable();
    let lifetimes = PrefixLifetimes {
        valid: lease.prefix.valid_lifetime,
        preferred: lease.prefix.preferred_lifetime,
    };

    let downstream: Vec<&LinkCandidate> = links
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != winner)
        .map(|(_, link)| link)
        .collect();
    if downstream.len() > MAX_DOWNSTREAM_LINKS {
        warn!(
            links = downstream.len(),
            max = MAX_DOWNSTREAM_LINKS,
            "more downstream links than sub-prefixes, skipping the rest"
        );
    }

    let mut assignments = Vec::new();
    for (open, prefix) in downstream.into_iter().zip(allocate(delegated, usize::MAX)) {
        match ctx.platform.install_prefix(open.name(), prefix, lifetimes) {
            Ok(()) => {
                info!(link = open.name(), %prefix, "installed prefix");
                assignments.push(Assignment {
                    link: open.link.clone(),
                    prefix,
                });
            }
            Err(e) => error!(link = open.name(), %prefix, %e, "failed to install prefix"),
        }
    }

    match links.get(winner) {
        Some(upstream) => {
            match ctx
                .platform
                .install_default_route(upstream.name(), lease.server_addr)
            {
                Ok(()) => info!(link = upstream.name(), gateway = %lease.server_addr, "installed default route"),
                Err(e) => error!(link = upstream.name(), %e, "failed to install default route"),
            }
        }
        None => error!(winner, "winning link is not open"),
    }

    assignments
}
