//! Solicit/Advertise/Request/Reply across every open link.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::{
    context::Context,
    correlator::{Observed, ReplyCorrelator},
    error::Error,
    iaid_for,
    platform::ReceiveFilter,
    registry::{DeviceRegistry, LinkCandidate},
    wire::{
        dhcpv6::{self, DhcpOption, IaPd, Message, MessageType},
        frame,
    },
    CLIENT_PORT, IA_PD_T1, IA_PD_T2, SERVER_PORT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeOutcome {
    #[default]
    Pending,
    Advertised,
    Replied,
    TimedOut,
}

/// Base timeout plus a uniform draw from `[0, jitter)`.
pub fn jittered_timeout<R: Rng + ?Sized>(base: Duration, jitter: Duration, rng: &mut R) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rng.gen_range(0..jitter_ms))
}

/// What the driver does after feeding the schedule an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Transmit `next_message()` on the link at `cursor()`
    Continue,
    /// A Reply arrived on this link
    Done(usize),
    Exhausted,
}

/// Retry and backoff bookkeeping, free of I/O.
///
/// One round transmits on every link in order. A reply is checked after each
/// transmission; only the last link of a round is followed by a wait.
#[derive(Debug, Clone)]
pub struct Schedule {
    links: usize,
    retries_left: u32,
    timeout: Duration,
    max_timeout: Duration,
    cursor: usize,
    message: MessageType,
    outcome: ExchangeOutcome,
}

impl Schedule {
    pub fn new(links: usize, retries: u32, timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            links: links.max(1),
            retries_left: retries.max(1),
            timeout: timeout.min(max_timeout),
            max_timeout,
            cursor: 0,
            message: MessageType::Solicit,
            outcome: ExchangeOutcome::Pending,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn outcome(&self) -> ExchangeOutcome {
        self.outcome
    }

    /// Solicit until an Advertise has been seen, Request afterwards
    pub fn next_message(&self) -> MessageType {
        self.message
    }

    /// Called once the cursor link has been sent to. Returns how long to wait
    /// when that closed the round.
    pub fn on_sent(&self) -> Option<Duration> {
        (self.cursor + 1 >= self.links).then_some(self.timeout)
    }

    pub fn on_observed(&mut self, observed: Option<Observed>) -> Step {
        match observed {
            Some(Observed {
                msg_type: MessageType::Reply,
                link,
            }) => {
                self.outcome = ExchangeOutcome::Replied;
                Step::Done(link)
            }
            Some(Observed {
                msg_type: MessageType::Advertise,
                link,
            }) if link < self.links => {
                // go straight back to the advertising link with a Request
                self.message = MessageType::Request;
                self.outcome = ExchangeOutcome::Advertised;
                self.cursor = link;
                Step::Continue
            }
            _ => self.advance(),
        }
    }

    fn advance(&mut self) -> Step {
        if self.cursor + 1 < self.links {
            self.cursor += 1;
            return Step::Continue;
        }
        self.retries_left -= 1;
        if self.retries_left == 0 {
            self.outcome = ExchangeOutcome::TimedOut;
            return Step::Exhausted;
        }
        self.cursor = 0;
        self.timeout = self
            .timeout
            .checked_mul(7)
            .map_or(self.max_timeout, |t| t / 4)
            .min(self.max_timeout);
        Step::Continue
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub outcome: ExchangeOutcome,
    /// Registry index of the link the Reply arrived on
    pub winner: Option<usize>,
}

pub struct ExchangeEngine<'a> {
    ctx: &'a Arc<Context>,
    registry: &'a DeviceRegistry,
}

impl<'a> ExchangeEngine<'a> {
    pub fn new(ctx: &'a Arc<Context>, registry: &'a DeviceRegistry) -> Self {
        Self { ctx, registry }
    }

    /// Run one exchange over the registry's open links.
    ///
    /// On `TimedOut` the reply slot, lease state included, is left empty.
    #[instrument(skip(self), fields(links = self.registry.links().len()))]
    pub fn run(&self) -> Result<Exchange, Error> {
        let links = self.registry.links();
        if links.is_empty() {
            return Err(Error::NoSuitableDevice);
        }
        let config = &self.ctx.config;

        self.ctx.replies.reset();
        let timeout = jittered_timeout(
            config.base_timeout(),
            config.timeout_jitter(),
            &mut rand::thread_rng(),
        );
        let mut schedule = Schedule::new(
            links.len(),
            config.send_retries,
            timeout,
            config.max_timeout(),
        );

        let handler = ReplyCorrelator::new(Arc::clone(self.ctx)).into_handler();
        self.ctx
            .platform
            .register_receiver(ReceiveFilter::DHCPV6_CLIENT, handler)?;

        info!(timeout_ms = timeout.as_millis() as u64, "sending DHCPv6 solicit");
        let started = Instant::now();
        let exchange = loop {
            let link = &links[schedule.cursor()];
            self.send(link, schedule.next_message(), started.elapsed());

            if let Some(wait) = schedule.on_sent() {
                debug!(wait_ms = wait.as_millis() as u64, "round sent, waiting");
                self.ctx.replies.wait(wait);
            }

            let before = schedule.retries_left();
            match schedule.on_observed(self.ctx.replies.take()) {
                Step::Continue => {
                    if schedule.retries_left() < before {
                        debug!(
                            retries_left = schedule.retries_left(),
                            timeout_ms = schedule.timeout().as_millis() as u64,
                            "no answer, retrying"
                        );
                    }
                }
                Step::Done(winner) => {
                    break Exchange {
                        outcome: schedule.outcome(),
                        winner: Some(winner),
                    };
                }
                Step::Exhausted => {
                    warn!("DHCPv6 exchange timed out");
                    self.ctx.replies.reset();
                    break Exchange {
                        outcome: schedule.outcome(),
                        winner: None,
                    };
                }
            }
        };

        self.ctx
            .platform
            .unregister_receiver(ReceiveFilter::DHCPV6_CLIENT);
        Ok(exchange)
    }

    /// Build and transmit one message. Failures are logged and otherwise
    /// ignored.
    fn send(&self, link: &LinkCandidate, msg_type: MessageType, elapsed: Duration) {
        let msg = self.build(link, msg_type, elapsed);
        let frame = frame::udp_frame(
            link.link.mac,
            link.link.link_local(),
            frame::ALL_DHCP_SERVERS,
            CLIENT_PORT,
            SERVER_PORT,
            &msg.to_vec(),
        );
        debug!(link = link.name(), ?msg_type, xid = %link.xid, "transmit");
        if let Err(source) = self.ctx.platform.transmit(link.name(), &frame) {
            let err = Error::TransmitFailure {
                link: link.link.name.clone(),
                source,
            };
            warn!(%err, "transmit failed");
        }
    }

    fn build(&self, link: &LinkCandidate, msg_type: MessageType, elapsed: Duration) -> Message {
        let mut msg = Message::new(msg_type, link.xid);
        msg.opts
            .push(DhcpOption::ClientId(self.ctx.client_duid(link.link.mac)));

        let mut ia_pd = IaPd {
            iaid: iaid_for(link.link.mac),
            t1: IA_PD_T1,
            t2: IA_PD_T2,
            prefix: None,
            status: None,
        };
        if msg_type == MessageType::Request {
            let lease = self.ctx.replies.lease_state();
            if let Some(server_id) = lease.server_id {
                msg.opts.push(DhcpOption::ServerId(server_id));
            }
            ia_pd.prefix = lease.prefix;
        }

        msg.opts
            .push(DhcpOption::OptionRequest(dhcpv6::REQUESTED_OPTIONS));
        msg.opts.push(DhcpOption::ElapsedTime(dhcpv6::elapsed_from_ms(
            elapsed.as_millis(),
        )));
        msg.opts.push(DhcpOption::IaPd(ia_pd));
        msg
    }
}
