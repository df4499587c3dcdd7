//! Client lifecycle: discovery, exchange, installation and announcements
//! behind a single start and a single shutdown.

use std::{
    sync::{mpsc::Sender, Arc},
    thread,
};

use compact_str::CompactString;
use tracing::{error, info, instrument, warn};

use crate::{
    announcer::{self, AnnouncerHandle},
    config::Config,
    context::Context,
    distributor::{self, Assignment},
    error::Error,
    exchange::{ExchangeEngine, ExchangeOutcome},
    platform::Platform,
    registry::DeviceRegistry,
    Lease,
};


/// A configured client: the lease is installed and router advertisements
/// are running on the downstream links.
pub struct Danir {
    ctx: Arc<Context>,
    lease: Arc<Lease>,
    assignments: Vec<Assignment>,
    announcer: Option<AnnouncerHandle>,
}

impl Danir {
    /// Negotiate a delegated prefix and start announcing it.
    ///
    /// Blocks for the whole exchange. Returns once the announcer thread is
    /// running.
    pub fn start(config: Config, platform: Arc<dyn Platform>) -> Result<Self, Error> {
        Self::start_with_context(Context::new(config, platform))
    }

    #[instrument(skip_all)]
    pub fn start_with_context(ctx: Arc<Context>) -> Result<Self, Error> {
        let attempts = ctx.config.reopen_retries.saturating_add(1);
        let mut registry = DeviceRegistry::new(Arc::clone(&ctx));

        for attempt in 1..=attempts {
            registry.wait_for_candidates(ctx.config.device_wait_polls)?;
            match registry.open_candidates() {
                Ok(()) => {}
                Err(Error::NoCarrier) => warn!("continuing without carrier"),
                Err(e) => {
                    Self::abandon(&ctx, &mut registry);
                    return Err(e);
                }
            }
            thread::sleep(ctx.config.post_open());

            let exchange = match ExchangeEngine::new(&ctx, &registry).run() {
                Ok(exchange) => exchange,
                Err(e) => {
                    error!(%e, "exchange failed");
                    Self::abandon(&ctx, &mut registry);
                    return Err(e);
                }
            };
            if let (ExchangeOutcome::Replied, Some(winner)) = (exchange.outcome, exchange.winner) {
                return Self::complete(ctx, registry, winner);
            }

            registry.close_candidates(None);
            if attempt < attempts {
                warn!(attempt, "reopening network devices");
            }
        }

        ctx.replies.reset();
        error!("auto-configuration of network failed");
        Err(Error::ExchangeTimedOut)
    }

    fn complete(
        ctx: Arc<Context>,
        mut registry: DeviceRegistry,
        winner: usize,
    ) -> Result<Self, Error> {
        let upstream: CompactString = match registry.get(winner) {
            Some(open) => open.link.name.clone(),
            None => {
                ctx.replies.reset();
                return Err(Error::ExchangeTimedOut);
            }
        };
        let Some(lease) = ctx.replies.lease_state().freeze(&upstream) else {
            error!(link = %upstream, "reply left an incomplete lease");
            ctx.replies.reset();
            registry.close_candidates(None);
            return Err(Error::ExchangeTimedOut);
        };
        let lease = Arc::new(lease);
        ctx.lease.store(Some(Arc::clone(&lease)));
        info!(
            link = %upstream,
            server = %lease.server_addr,
            prefix = %lease.prefix.prefix,
            prefix_len = lease.prefix.prefix_len,
            valid = lease.prefix.valid_lifetime,
            preferred = lease.prefix.preferred_lifetime,
            "got DHCPv6 reply"
        );

        let assignments = distributor::distribute(&ctx, registry.links(), winner, &lease);
        registry.close_candidates(Some(upstream.as_str()));

        let announcer = match announcer::spawn(Arc::clone(&ctx), assignments.clone()) {
            Ok(announcer) => announcer,
            Err(e) => {
                error!(%e, "could not start the announcer");
                Self::abandon(&ctx, &mut registry);
                return Err(e);
            }
        };
        Ok(Self {
            ctx,
            lease,
            assignments,
            announcer: Some(announcer),
        })
    }

    /// Drop the lease and every link still held, leaving the context as it
    /// was before the attempt. Installed prefixes and routes stay behind.
    fn abandon(ctx: &Context, registry: &mut DeviceRegistry) {
        ctx.lease.store(None);
        ctx.replies.reset();
        registry.close_candidates(None);
    }

    pub fn lease(&self) -> Arc<Lease> {
        Arc::clone(&self.lease)
    }

    /// Name of the link the lease was obtained on
    pub fn upstream(&self) -> &str {
        &self.lease.link
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Sender that stops the announcer, for a signal handler
    pub fn stop_signal(&self) -> Option<Sender<()>> {
        self.announcer.as_ref().map(AnnouncerHandle::stopper)
    }

    /// Block until the announcer is stopped through [`Danir::stop_signal`],
    /// then release the upstream link.
    pub fn wait(mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.join();
        }
        self.release();
    }

    /// Stop announcing and give back every link.
    pub fn shutdown(mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.stop();
        }
        self.release();
    }

    fn release(&self) {
        self.ctx.platform.release_link(self.upstream());
        self.ctx.links.clear();
        info!(link = self.upstream(), "shut down");
    }
}
