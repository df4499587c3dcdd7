//! Scripted platform and DHCPv6 server used by the unit and scenario tests.

use std::{
    net::Ipv6Addr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use advmac::MacAddr6;
use compact_str::CompactString;
use dhcproto::{
    v6::{self, DhcpOption, DhcpOptions, IAPrefix, IAPD},
    Decodable, Encodable,
};
use ipnet::Ipv6Net;

use crate::{
    platform::{FrameHandler, LinkInfo, Platform, PlatformError, PrefixLifetimes, ReceiveFilter},
    wire::{dhcpv6::MessageType, frame},
    Duid, Xid, CLIENT_PORT, SERVER_PORT,
};

pub(crate) const SERVER_MAC: MacAddr6 = MacAddr6::new([0x02, 0, 0, 0, 0, 0x01]);
pub(crate) const PREFERRED_LIFETIME: u32 = 14_400;
pub(crate) const VALID_LIFETIME: u32 = 86_400;

/// Broadcast-capable link with carrier, MAC 52:54:00:00:00:<n>
pub(crate) fn ethernet(name: &str, n: u8) -> LinkInfo {
    LinkInfo {
        name: name.into(),
        mtu: 1500,
        mac: MacAddr6::new([0x52, 0x54, 0, 0, 0, n]),
        loopback: false,
        broadcast: true,
        point_to_point: false,
        carrier: true,
        link_local: None,
    }
}

pub(crate) type Responder = Box<dyn FnMut(&str, &[u8]) -> Vec<Vec<u8>> + Send>;

/// Records everything the client asks of the platform. Frames handed to
/// `transmit` are passed to the responder and whatever it returns is
/// delivered to the registered receiver on the same link, synchronously
/// unless a delivery delay is set.
#[derive(Default)]
pub(crate) struct MockPlatform {
    links: Mutex<Vec<LinkInfo>>,
    hidden_polls: AtomicUsize,
    link_polls: AtomicUsize,
    failing_up: Mutex<Vec<CompactString>>,
    up: Mutex<Vec<CompactString>>,
    sent: Mutex<Vec<(CompactString, Vec<u8>)>>,
    prefixes: Mutex<Vec<(CompactString, Ipv6Net, PrefixLifetimes)>>,
    routes: Mutex<Vec<(CompactString, Ipv6Addr)>>,
    released: Mutex<Vec<CompactString>>,
    receiver: Mutex<Option<FrameHandler>>,
    refuse_receiver: AtomicBool,
    responder: Mutex<Option<Responder>>,
    delivery_delay: Mutex<Option<Duration>>,
}

impl MockPlatform {
    pub fn new(links: Vec<LinkInfo>) -> Self {
        Self {
            links: Mutex::new(links),
            ..Default::default()
        }
    }

    pub fn with_responder(self, responder: Responder) -> Self {
        *self.responder.lock().unwrap() = Some(responder);
        self
    }

    /// Deliver responses from a separate thread after `delay`, the way a
    /// capture thread would
    pub fn with_delivery_delay(self, delay: Duration) -> Self {
        *self.delivery_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn refuse_receiver(&self) {
        self.refuse_receiver.store(true, Ordering::SeqCst);
    }

    /// Report no links for the first `polls` enumerations
    pub fn hide_links_for(&self, polls: usize) {
        self.hidden_polls.store(polls, Ordering::SeqCst);
    }

    pub fn fail_link_up(&self, name: &str) {
        self.failing_up.lock().unwrap().push(name.into());
    }

    pub fn set_carrier(&self, name: &str, carrier: bool) {
        for link in self.links.lock().unwrap().iter_mut() {
            if link.name == name {
                link.carrier = carrier;
            }
        }
    }

    pub fn link_polls(&self) -> usize {
        self.link_polls.load(Ordering::SeqCst)
    }

    pub fn up(&self) -> Vec<CompactString> {
        self.up.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(CompactString, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_on(&self, link: &str) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|(name, _)| name == link)
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn prefixes(&self) -> Vec<(CompactString, Ipv6Net, PrefixLifetimes)> {
        self.prefixes.lock().unwrap().clone()
    }

    pub fn routes(&self) -> Vec<(CompactString, Ipv6Addr)> {
        self.routes.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<CompactString> {
        self.released.lock().unwrap().clone()
    }

    pub fn has_receiver(&self) -> bool {
        self.receiver.lock().unwrap().is_some()
    }

    /// Push a frame at the receiver as if it arrived on `link`
    pub fn deliver(&self, link: &str, frame: &[u8]) {
        let handler = self.receiver.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(link, frame);
        }
    }
}

impl Platform for MockPlatform {
    fn links(&self) -> Result<Vec<LinkInfo>, PlatformError> {
        self.link_polls.fetch_add(1, Ordering::SeqCst);
        let hidden = self.hidden_polls.load(Ordering::SeqCst);
        if hidden > 0 {
            self.hidden_polls.store(hidden - 1, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        Ok(self.links.lock().unwrap().clone())
    }

    fn set_link_up(&self, link: &str) -> Result<(), PlatformError> {
        if self.failing_up.lock().unwrap().iter().any(|l| l == link) {
            return Err(PlatformError::Failed {
                op: "set_link_up",
                link: link.into(),
                reason: "operation not permitted".into(),
            });
        }
        self.up.lock().unwrap().push(link.into());
        Ok(())
    }

    fn transmit(&self, link: &str, frame: &[u8]) -> Result<(), PlatformError> {
        self.sent
            .lock()
            .unwrap()
            .push((link.into(), frame.to_vec()));
        let responses = match self.responder.lock().unwrap().as_mut() {
            Some(respond) => respond(link, frame),
            None => Vec::new(),
        };
        let delay = *self.delivery_delay.lock().unwrap();
        match delay {
            Some(delay) if !responses.is_empty() => {
                let handler = self.receiver.lock().unwrap().clone();
                let link = link.to_string();
                thread::spawn(move || {
                    thread::sleep(delay);
                    if let Some(handler) = handler {
                        for response in responses {
                            handler(&link, &response);
                        }
                    }
                });
            }
            _ => {
                for response in responses {
                    self.deliver(link, &response);
                }
            }
        }
        Ok(())
    }

    fn register_receiver(
        &self,
        filter: ReceiveFilter,
        handler: FrameHandler,
    ) -> Result<(), PlatformError> {
        assert_eq!(filter, ReceiveFilter::DHCPV6_CLIENT);
        if self.refuse_receiver.load(Ordering::SeqCst) {
            return Err(PlatformError::Failed {
                op: "register_receiver",
                link: "any".into(),
                reason: "capture unavailable".into(),
            });
        }
        *self.receiver.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn unregister_receiver(&self, _filter: ReceiveFilter) {
        *self.receiver.lock().unwrap() = None;
    }

    fn install_prefix(
        &self,
        link: &str,
        prefix: Ipv6Net,
        lifetimes: PrefixLifetimes,
    ) -> Result<(), PlatformError> {
        self.prefixes
            .lock()
            .unwrap()
            .push((link.into(), prefix, lifetimes));
        Ok(())
    }

    fn install_default_route(&self, link: &str, gateway: Ipv6Addr) -> Result<(), PlatformError> {
        self.routes.lock().unwrap().push((link.into(), gateway));
        Ok(())
    }

    fn release_link(&self, link: &str) {
        self.released.lock().unwrap().push(link.into());
    }
}

/// Accessors on dhcproto messages the fake server needs
trait ServerMessageExt {
    fn client_id(&self) -> Option<&[u8]>;
    fn ia_pd(&self) -> Option<&IAPD>;
}

impl ServerMessageExt for v6::Message {
    fn client_id(&self) -> Option<&[u8]> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::ClientId(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    fn ia_pd(&self) -> Option<&IAPD> {
        self.opts().iter().find_map(|opt| match opt {
            DhcpOption::IAPD(iapd) => Some(iapd),
            _ => None,
        })
    }
}

/// A DHCPv6 server that delegates one prefix to whoever asks.
#[derive(Clone)]
pub(crate) struct FakeServer {
    duid: Duid,
    prefix: Ipv6Net,
    /// Answer Solicit with Advertise
    pub advertise: bool,
    /// Answer Request with Reply
    pub reply: bool,
}

impl FakeServer {
    pub fn new(prefix: &str) -> Self {
        Self {
            duid: Duid::link_layer_time(SERVER_MAC, 1_000),
            prefix: prefix.parse().unwrap(),
            advertise: true,
            reply: true,
        }
    }

    pub fn duid(&self) -> Duid {
        self.duid
    }

    pub fn addr(&self) -> Ipv6Addr {
        frame::link_local_from_mac(SERVER_MAC)
    }

    pub fn prefix(&self) -> Ipv6Net {
        self.prefix
    }

    fn build(
        &self,
        msg_type: MessageType,
        xid: Xid,
        client_id: &[u8],
        iaid: u32,
        with_prefix: bool,
    ) -> Vec<u8> {
        let msg_type = match msg_type {
            MessageType::Advertise => v6::MessageType::Advertise,
            MessageType::Reply => v6::MessageType::Reply,
            other => panic!("fake server does not send {other:?}"),
        };
        let mut reply = v6::Message::new_with_id(msg_type, xid.as_bytes());
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::ClientId(client_id.to_vec()));
        opts.insert(DhcpOption::ServerId(self.duid.to_bytes().to_vec()));
        if matches!(msg_type, v6::MessageType::Advertise) {
            opts.insert(DhcpOption::Preference(255));
        }
        let mut ia_pd_opts = DhcpOptions::new();
        if with_prefix {
            ia_pd_opts.insert(DhcpOption::IAPrefix(IAPrefix {
                preferred_lifetime: PREFERRED_LIFETIME,
                valid_lifetime: VALID_LIFETIME,
                prefix_len: self.prefix.prefix_len(),
                prefix_ip: self.prefix.network(),
                opts: DhcpOptions::new(),
            }));
        }
        opts.insert(DhcpOption::IAPD(IAPD {
            id: iaid,
            t1: 3600,
            t2: 5400,
            opts: ia_pd_opts,
        }));
        reply.to_vec().expect("dhcproto encodes")
    }

    /// Encoded DHCPv6 payload for a client we have not heard from
    pub fn message(&self, msg_type: MessageType, xid: Xid) -> Vec<u8> {
        let client = Duid::link_layer_time(MacAddr6::new([0x52, 0x54, 0, 0, 0, 1]), 0);
        self.build(msg_type, xid, &client.to_bytes(), 1, true)
    }

    /// Wrap a payload into a frame from this server to a client link-local address
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        frame::udp_frame(
            SERVER_MAC,
            self.addr(),
            "fe80::5054:ff:fe00:1".parse().unwrap(),
            SERVER_PORT,
            CLIENT_PORT,
            payload,
        )
    }

    pub fn frame(&self, msg_type: MessageType, xid: Xid) -> Vec<u8> {
        self.wrap(&self.message(msg_type, xid))
    }

    pub fn frame_without_prefix(&self, msg_type: MessageType, xid: Xid) -> Vec<u8> {
        let client = Duid::link_layer_time(MacAddr6::new([0x52, 0x54, 0, 0, 0, 1]), 0);
        self.wrap(&self.build(msg_type, xid, &client.to_bytes(), 1, false))
    }

    /// Answer a client frame the way a server on the link would
    pub fn respond(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let Ok(dgram) = frame::parse_udp(frame) else {
            return Vec::new();
        };
        let Ok(msg) = v6::Message::from_bytes(dgram.payload) else {
            return Vec::new();
        };
        let (Some(client_id), Some(ia_pd)) = (msg.client_id(), msg.ia_pd()) else {
            return Vec::new();
        };
        let answer = match msg.msg_type() {
            v6::MessageType::Solicit if self.advertise => MessageType::Advertise,
            v6::MessageType::Request if self.reply => MessageType::Reply,
            _ => return Vec::new(),
        };
        let payload = self.build(answer, Xid(msg.xid()), client_id, ia_pd.id, true);
        vec![frame::udp_frame(
            SERVER_MAC,
            self.addr(),
            dgram.src,
            SERVER_PORT,
            CLIENT_PORT,
            &payload,
        )]
    }

    pub fn responder(self) -> Responder {
        Box::new(move |_link: &str, frame: &[u8]| self.respond(frame))
    }
}
