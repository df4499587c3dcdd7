//! Link discovery and preparation: which links to solicit on, their
//! transaction ids, bring-up and carrier.

use std::{
    collections::HashSet,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use rand::rngs::OsRng;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    context::{Context, LinkTag},
    error::Error,
    platform::LinkInfo,
    Xid,
};

/// A candidate link found by discovery. Only `able` ones are opened and
/// carry an xid; the rest are kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCandidate {
    pub link: LinkInfo,
    /// MTU large enough for a DHCPv6 exchange
    pub able: bool,
    pub xid: Xid,
}

impl LinkCandidate {
    pub fn name(&self) -> &str {
        &self.link.name
    }
}

/// Whether a link is worth considering at all.
///
/// Loopback is never used. A user supplied device name must match exactly;
/// otherwise any broadcast or point-to-point link qualifies unless it is a
/// dummy device.
pub fn is_candidate(link: &LinkInfo, user_device: Option<&str>) -> bool {
    if link.loopback {
        return false;
    }
    match user_device {
        Some(name) => link.name == name,
        None => (link.point_to_point || link.broadcast) && !link.name.starts_with("dummy"),
    }
}

pub struct DeviceRegistry {
    ctx: Arc<Context>,
    links: Vec<LinkCandidate>,
    unable: Vec<LinkCandidate>,
}

impl DeviceRegistry {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            links: Vec::new(),
            unable: Vec::new(),
        }
    }

    /// Open links in discovery order
    pub fn links(&self) -> &[LinkCandidate] {
        &self.links
    }

    /// Candidates passed over in the last pass because their MTU is too small
    pub fn unable(&self) -> &[LinkCandidate] {
        &self.unable
    }

    pub fn get(&self, index: usize) -> Option<&LinkCandidate> {
        self.links.get(index)
    }

    fn user_device(&self) -> Option<&str> {
        self.ctx.config.user_device()
    }

    /// Poll until at least one candidate link exists.
    #[instrument(skip(self))]
    pub fn wait_for_candidates(&self, max_polls: u32) -> Result<(), Error> {
        let poll = self.ctx.config.device_poll();
        for attempt in 0..max_polls {
            let found = self
                .ctx
                .platform
                .links()?
                .iter()
                .any(|link| is_candidate(link, self.user_device()));
            if found {
                debug!(attempt, "candidate link present");
                return Ok(());
            }
            if attempt + 1 < max_polls {
                thread::sleep(poll);
            }
        }
        error!("no network devices found");
        Err(Error::NoDevicesFound)
    }

    /// Enumerate, filter and bring up links, then wait for carrier.
    ///
    /// Replaces whatever a previous pass opened. Each eligible link gets a
    /// fresh xid, distinct from every other link's in this pass.
    /// [`Error::NoCarrier`] is advisory: the links stay open.
    #[instrument(skip(self))]
    pub fn open_candidates(&mut self) -> Result<(), Error> {
        self.links.clear();
        self.unable.clear();
        self.ctx.links.clear();

        let min_mtu = self.ctx.config.min_mtu;
        let mut used = HashSet::new();
        for link in self.ctx.platform.links()? {
            if !is_candidate(&link, self.user_device()) {
                continue;
            }
            if link.mtu < min_mtu {
                warn!(link = %link.name, mtu = link.mtu, min_mtu, "MTU too small, skipping");
                self.unable.push(LinkCandidate {
                    link,
                    able: false,
                    xid: Xid::default(),
                });
                continue;
            }
            if let Err(e) = self.ctx.platform.set_link_up(&link.name) {
                error!(link = %link.name, %e, "failed to bring link up");
                continue;
            }

            let xid = loop {
                let xid = Xid::random(&mut OsRng);
                if used.insert(xid) {
                    break xid;
                }
            };
            self.links
                .try_reserve(1)
                .map_err(|_| Error::AllocationFailure)?;
            self.ctx.links.insert(
                link.name.clone(),
                LinkTag {
                    index: self.links.len(),
                    xid,
                },
            );
            info!(link = %link.name, mtu = link.mtu, mac = %link.mac, %xid, "opened link");
            self.links.push(LinkCandidate {
                link,
                able: true,
                xid,
            });
        }

        if self.links.is_empty() {
            match self.user_device() {
                Some(name) => error!(device = name, "device not found or not usable"),
                None => error!(
                    too_small = self.unable.len(),
                    "no suitable network devices available"
                ),
            }
            return Err(Error::NoSuitableDevice);
        }

        self.wait_for_carrier()
    }

    fn wait_for_carrier(&mut self) -> Result<(), Error> {
        let timeout = self.ctx.config.carrier_timeout();
        let poll = self.ctx.config.carrier_poll();
        let report_every = timeout / 12;
        let start = Instant::now();
        let mut next_report = start;

        loop {
            let current = self.ctx.platform.links()?;
            let mut any = false;
            for open in self.links.iter_mut() {
                if let Some(now) = current.iter().find(|l| l.name == open.link.name) {
                    open.link.carrier = now.carrier;
                    any |= now.carrier;
                }
            }
            if any {
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "no carrier on any link, continuing anyway"
                );
                return Err(Error::NoCarrier);
            }
            if Instant::now() >= next_report {
                info!(
                    remaining_secs = (timeout - elapsed).as_secs(),
                    "waiting for carrier"
                );
                next_report += report_every.max(Duration::from_millis(1));
            }
            thread::sleep(poll.min(timeout - elapsed));
        }
    }

    /// Give back every open link except `keep`. Returns the links released.
    pub fn close_candidates(&mut self, keep: Option<&str>) -> Vec<LinkCandidate> {
        self.unable.clear();
        let (kept, released): (Vec<_>, Vec<_>) = self
            .links
            .drain(..)
            .partition(|open| Some(open.name()) == keep);

        for open in &released {
            self.ctx.links.remove(open.name());
            self.ctx.platform.release_link(open.name());
            debug!(link = open.name(), "released link");
        }
        // the kept link is now the only one, index 0
        for (index, open) in kept.iter().enumerate() {
            self.ctx.links.insert(
                open.link.name.clone(),
                LinkTag {
                    index,
                    xid: open.xid,
                },
            );
        }
        self.links = kept;
        released
    }
}
