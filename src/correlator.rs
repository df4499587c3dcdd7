//! Receive path: matches inbound DHCPv6 frames to the outstanding
//! transaction and feeds the lease state.

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::{debug, field, info, instrument, trace, warn, Span};

use crate::{
    context::Context,
    error::Error,
    platform::FrameHandler,
    wire::{
        dhcpv6::{Message, MessageType},
        frame::{self, FrameError},
        DecodeError,
    },
    LeaseState, Xid, CLIENT_PORT, SERVER_PORT,
};

/// State shared between the exchange loop and the receive callback.
#[derive(Debug, Default)]
pub struct ReplySlot {
    /// Set when an Advertise or Reply has been accepted and not yet consumed
    pub pending: bool,
    pub msg_type: Option<MessageType>,
    /// Registry index of the link the message arrived on
    pub link: Option<usize>,
    pub lease: LeaseState,
}

/// An accepted message as seen by the exchange loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub msg_type: MessageType,
    pub link: usize,
}

/// [`ReplySlot`] behind a mutex, plus the condition variable the exchange
/// waits on. Lock poisoning is ignored.
#[derive(Debug, Default)]
pub struct ReplyChannel {
    slot: Mutex<ReplySlot>,
    ready: Condvar,
}

impl ReplyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ReplySlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a message is pending or `timeout` elapses. Returns whether
    /// one is pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |slot| !slot.pending)
            .unwrap_or_else(PoisonError::into_inner);
        guard.pending
    }

    /// Consume a pending Advertise, or peek at a pending Reply. A Reply stays
    /// pending so later frames are dropped until the next reset.
    pub fn take(&self) -> Option<Observed> {
        let mut slot = self.lock();
        if !slot.pending {
            return None;
        }
        let observed = Observed {
            msg_type: slot.msg_type?,
            link: slot.link?,
        };
        if observed.msg_type == MessageType::Advertise {
            slot.pending = false;
        }
        Some(observed)
    }

    /// Forget everything, including the lease
    pub fn reset(&self) {
        *self.lock() = ReplySlot::default();
    }

    pub fn lease_state(&self) -> LeaseState {
        self.lock().lease.clone()
    }

    fn notify(&self) {
        self.ready.notify_all();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DropReason {
    BadFrame(FrameError),
    NotDhcpv6,
    UnknownLink,
    NotForUs,
    Malformed(DecodeError),
    UnexpectedType(u8),
    NoServerId,
    NoPrefix,
    ReplyPending,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::BadFrame(_) => "BadFrame",
            DropReason::NotDhcpv6 => "NotDhcpv6",
            DropReason::UnknownLink => "UnknownLink",
            DropReason::NotForUs => "NotForUs",
            DropReason::Malformed(_) => "Malformed",
            DropReason::UnexpectedType(_) => "UnexpectedType",
            DropReason::NoServerId => "NoServerId",
            DropReason::NoPrefix => "NoPrefix",
            DropReason::ReplyPending => "ReplyPending",
        }
    }
}

/// What happened to one inbound frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(MessageType),
    Dropped(DropReason),
}

#[derive(Clone)]
pub struct ReplyCorrelator {
    ctx: Arc<Context>,
}

impl ReplyCorrelator {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Wrap into the callback the platform delivers frames to.
    pub fn into_handler(self) -> FrameHandler {
        Arc::new(move |link: &str, frame: &[u8]| {
            let verdict = self.on_frame(link, frame);
            if let Verdict::Dropped(reason) = verdict {
                trace!(link, reason = reason.as_str(), "frame dropped");
            }
        })
    }

    #[instrument(skip(self, frame), fields(xid = field::Empty))]
    pub fn on_frame(&self, link: &str, frame: &[u8]) -> Verdict {
        let dgram = match frame::parse_udp(frame) {
            Ok(dgram) => dgram,
            Err(e) => return Verdict::Dropped(DropReason::BadFrame(e)),
        };
        if dgram.src_port != SERVER_PORT || dgram.dst_port != CLIENT_PORT {
            return Verdict::Dropped(DropReason::NotDhcpv6);
        }
        let payload = dgram.payload;
        if payload.len() < 4 {
            return Verdict::Dropped(DropReason::Malformed(DecodeError::Truncated));
        }
        let xid = Xid([payload[1], payload[2], payload[3]]);
        Span::current().record("xid", field::display(xid));

        let Some(tag) = self.ctx.links.get(link).map(|tag| *tag) else {
            debug!("frame on a link that is not open");
            return Verdict::Dropped(DropReason::UnknownLink);
        };
        if xid != tag.xid {
            let err = Error::NotForUs {
                got: xid,
                expected: tag.xid,
            };
            warn!(%err, "dropping reply");
            return Verdict::Dropped(DropReason::NotForUs);
        }

        let msg_type = MessageType::from_u8(payload[0]);
        if !matches!(msg_type, Some(MessageType::Advertise | MessageType::Reply)) {
            let mut slot = self.ctx.replies.lock();
            if slot.pending {
                return Verdict::Dropped(DropReason::ReplyPending);
            }
            slot.lease.server_addr = None;
            debug!(msg_type = payload[0], "unexpected message type");
            return Verdict::Dropped(DropReason::UnexpectedType(payload[0]));
        }

        let msg = match Message::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%e, "failed to decode message");
                return Verdict::Dropped(DropReason::Malformed(e));
            }
        };
        let Some(server_id) = msg.server_id().copied() else {
            warn!(msg_type = ?msg.msg_type, "no server identifier");
            return Verdict::Dropped(DropReason::NoServerId);
        };
        let Some(prefix) = msg.delegated_prefix() else {
            warn!(msg_type = ?msg.msg_type, status = ?msg.ia_pd().and_then(|ia| ia.status.as_ref()), "no prefix delegated");
            return Verdict::Dropped(DropReason::NoPrefix);
        };

        {
            let mut slot = self.ctx.replies.lock();
            if slot.pending {
                debug!("already holding a reply");
                return Verdict::Dropped(DropReason::ReplyPending);
            }
            slot.lease.server_id = Some(server_id);
            slot.lease.server_link_addr = Some(server_id.link_addr);
            slot.lease.prefix = Some(prefix);
            if msg.msg_type == MessageType::Reply {
                slot.lease.server_addr = Some(dgram.src);
            }
            slot.pending = true;
            slot.msg_type = Some(msg.msg_type);
            slot.link = Some(tag.index);
        }
        self.ctx.replies.notify();

        info!(
            msg_type = ?msg.msg_type,
            server = %dgram.src,
            server_duid = %server_id.to_colon_string(),
            prefix = %prefix.prefix,
            prefix_len = prefix.prefix_len,
            "accepted"
        );
        Verdict::Accepted(msg.msg_type)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;
    use crate::{
        context::LinkTag,
        testutil::{self, FakeServer, MockPlatform},
        Config,
    };

    fn setup() -> (Arc<Context>, ReplyCorrelator, FakeServer) {
        let platform = Arc::new(MockPlatform::new(vec![testutil::ethernet("eth0", 1)]));
        let ctx = Context::new(Config::default(), platform);
        ctx.links.insert(
            "eth0".into(),
            LinkTag {
                index: 0,
                xid: Xid([1, 2, 3]),
            },
        );
        let correlator = ReplyCorrelator::new(Arc::clone(&ctx));
        (ctx, correlator, FakeServer::new("2001:db8:1::/56"))
    }

    #[test]
    fn advertise_fills_lease_without_address() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Advertise, Xid([1, 2, 3]));
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Accepted(MessageType::Advertise)
        );
        let slot = ctx.replies.lock();
        assert!(slot.pending);
        assert_eq!(slot.link, Some(0));
        assert_eq!(slot.lease.server_id, Some(server.duid()));
        assert_eq!(slot.lease.server_link_addr, Some(server.duid().link_addr));
        assert_eq!(slot.lease.prefix.unwrap().prefix_len, 56);
        assert_eq!(slot.lease.server_addr, None, "only a Reply sets the gateway");
    }

    #[test]
    fn reply_records_server_address() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Reply, Xid([1, 2, 3]));
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Accepted(MessageType::Reply)
        );
        assert_eq!(ctx.replies.lease_state().server_addr, Some(server.addr()));
    }

    #[test]
    fn xid_mismatch_leaves_state_untouched() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Reply, Xid([9, 9, 9]));
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Dropped(DropReason::NotForUs)
        );
        let slot = ctx.replies.lock();
        assert!(!slot.pending);
        assert!(slot.lease.is_empty());
    }

    #[test]
    fn second_message_dropped_while_pending() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Reply, Xid([1, 2, 3]));
        assert!(matches!(
            correlator.on_frame("eth0", &frame),
            Verdict::Accepted(_)
        ));
        let before = ctx.replies.lease_state();
        let other = FakeServer::new("2001:db8:ff::/56").frame(MessageType::Reply, Xid([1, 2, 3]));
        assert_eq!(
            correlator.on_frame("eth0", &other),
            Verdict::Dropped(DropReason::ReplyPending)
        );
        assert_eq!(ctx.replies.lease_state(), before);
    }

    #[test]
    fn unknown_link_and_wrong_ports() {
        let (_ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Reply, Xid([1, 2, 3]));
        assert_eq!(
            correlator.on_frame("eth9", &frame),
            Verdict::Dropped(DropReason::UnknownLink)
        );

        let payload = server.message(MessageType::Reply, Xid([1, 2, 3]));
        let wrong = frame::udp_frame(
            server.duid().link_addr,
            server.addr(),
            "fe80::2".parse().unwrap(),
            547,
            547,
            &payload,
        );
        assert_eq!(
            correlator.on_frame("eth0", &wrong),
            Verdict::Dropped(DropReason::NotDhcpv6)
        );
    }

    #[test]
    fn corrupt_frame_is_dropped() {
        let (ctx, correlator, server) = setup();
        let mut frame = server.frame(MessageType::Reply, Xid([1, 2, 3]));
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Dropped(DropReason::BadFrame(FrameError::BadChecksum))
        );
        assert!(ctx.replies.lease_state().is_empty());
    }

    #[test]
    fn malformed_message_is_dropped_without_mutation() {
        let (ctx, correlator, server) = setup();
        let mut payload = server.message(MessageType::Reply, Xid([1, 2, 3]));
        // rapid commit is not understood
        payload.extend_from_slice(&[0, 14, 0, 0]);
        let frame = server.wrap(&payload);
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Dropped(DropReason::Malformed(DecodeError::UnknownOption(14)))
        );
        assert!(ctx.replies.lease_state().is_empty());
    }

    #[test]
    fn other_types_clear_server_address() {
        let (ctx, correlator, server) = setup();
        ctx.replies.lock().lease.server_addr = Some("fe80::99".parse().unwrap());

        let mut payload = server.message(MessageType::Reply, Xid([1, 2, 3]));
        payload[0] = MessageType::Reconfigure.as_u8();
        assert_eq!(
            correlator.on_frame("eth0", &server.wrap(&payload)),
            Verdict::Dropped(DropReason::UnexpectedType(10))
        );
        assert_eq!(ctx.replies.lease_state().server_addr, None);
    }

    #[test]
    fn missing_prefix_or_server_id() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame_without_prefix(MessageType::Advertise, Xid([1, 2, 3]));
        assert_eq!(
            correlator.on_frame("eth0", &frame),
            Verdict::Dropped(DropReason::NoPrefix)
        );

        let mut msg = Message::new(MessageType::Advertise, Xid([1, 2, 3]));
        msg.opts = Message::decode(&server.message(MessageType::Advertise, Xid([1, 2, 3])))
            .unwrap()
            .opts
            .into_iter()
            .filter(|opt| !matches!(opt, crate::wire::dhcpv6::DhcpOption::ServerId(_)))
            .collect();
        assert_eq!(
            correlator.on_frame("eth0", &server.wrap(&msg.to_vec())),
            Verdict::Dropped(DropReason::NoServerId)
        );
        assert!(ctx.replies.lease_state().is_empty());
    }

    #[test]
    fn take_consumes_advertise_but_not_reply() {
        let (ctx, correlator, server) = setup();
        correlator.on_frame("eth0", &server.frame(MessageType::Advertise, Xid([1, 2, 3])));
        assert_eq!(
            ctx.replies.take(),
            Some(Observed {
                msg_type: MessageType::Advertise,
                link: 0
            })
        );
        assert_eq!(ctx.replies.take(), None);

        correlator.on_frame("eth0", &server.frame(MessageType::Reply, Xid([1, 2, 3])));
        assert!(ctx.replies.take().is_some());
        assert!(ctx.replies.take().is_some(), "reply stays pending");

        ctx.replies.reset();
        assert_eq!(ctx.replies.take(), None);
        assert!(ctx.replies.lease_state().is_empty());
    }

    #[test]
    fn wait_wakes_on_accept() {
        let (ctx, correlator, server) = setup();
        let frame = server.frame(MessageType::Reply, Xid([1, 2, 3]));
        let started = Instant::now();
        let receiver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            correlator.on_frame("eth0", &frame)
        });
        assert!(ctx.replies.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(receiver.join().unwrap(), Verdict::Accepted(_)));
    }

    #[test]
    fn wait_times_out() {
        let (ctx, _correlator, _server) = setup();
        let started = Instant::now();
        assert!(!ctx.replies.wait(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
