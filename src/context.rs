use std::sync::Arc;

use advmac::MacAddr6;
use arc_swap::ArcSwapOption;
use compact_str::CompactString;
use dashmap::DashMap;

use crate::{config::Config, correlator::ReplyChannel, platform::Platform, Duid, Lease, Xid};

/// Position and transaction id of an open link, keyed by link name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTag {
    pub index: usize,
    pub xid: Xid,
}

/// Written by the registry on every discovery pass, read by the receive path.
pub type LinkTable = DashMap<CompactString, LinkTag>;

/// Everything shared between the exchange, the receive callback and the
/// announcer.
pub struct Context {
    pub config: Config,
    pub platform: Arc<dyn Platform>,
    pub replies: ReplyChannel,
    pub links: LinkTable,
    /// Set once the exchange has a complete lease
    pub lease: ArcSwapOption<Lease>,
    duid_time: u32,
}

impl Context {
    pub fn new(config: Config, platform: Arc<dyn Platform>) -> Arc<Self> {
        let duid_time = config.resolve_duid_time();
        Arc::new(Self {
            config,
            platform,
            replies: ReplyChannel::new(),
            links: DashMap::new(),
            lease: ArcSwapOption::empty(),
            duid_time,
        })
    }

    /// Client identifier sent on the link with this MAC
    pub fn client_duid(&self, mac: MacAddr6) -> Duid {
        Duid::link_layer_time(mac, self.duid_time)
    }

    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.lease.load_full()
    }
}
