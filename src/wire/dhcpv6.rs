//! DHCPv6 message codec (RFC 8415), limited to what a prefix delegation
//! client sends and receives.

use std::net::Ipv6Addr;

use tracing::debug;

use super::{DecodeError, Reader};
use crate::{DelegatedPrefix, Duid, Xid};

pub const OPTION_CLIENTID: u16 = 1;
pub const OPTION_SERVERID: u16 = 2;
pub const OPTION_ORO: u16 = 6;
pub const OPTION_PREFERENCE: u16 = 7;
pub const OPTION_ELAPSED_TIME: u16 = 8;
pub const OPTION_STATUS_CODE: u16 = 13;
pub const OPTION_DNS_SERVERS: u16 = 23;
pub const OPTION_DOMAIN_LIST: u16 = 24;
pub const OPTION_IA_PD: u16 = 25;
pub const OPTION_IAPREFIX: u16 = 26;

/// Codes carried in every Option Request
pub const REQUESTED_OPTIONS: [u16; 2] = [OPTION_DNS_SERVERS, OPTION_DOMAIN_LIST];

const IA_PD_HEADER_LEN: usize = 12;
const IAPREFIX_LEN: usize = 25;
const OPTION_HEADER_LEN: usize = 4;

/// Status code 0, success
pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForw,
    RelayRepl,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MessageType::*;
        Some(match value {
            1 => Solicit,
            2 => Advertise,
            3 => Request,
            4 => Confirm,
            5 => Renew,
            6 => Rebind,
            7 => Reply,
            8 => Release,
            9 => Decline,
            10 => Reconfigure,
            11 => InformationRequest,
            12 => RelayForw,
            13 => RelayRepl,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        use MessageType::*;
        match self {
            Solicit => 1,
            Advertise => 2,
            Request => 3,
            Confirm => 4,
            Renew => 5,
            Rebind => 6,
            Reply => 7,
            Release => 8,
            Decline => 9,
            Reconfigure => 10,
            InformationRequest => 11,
            RelayForw => 12,
            RelayRepl => 13,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCode {
    pub status: u16,
    pub message: String,
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Identity Association for Prefix Delegation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaPd {
    pub iaid: [u8; 4],
    pub t1: u32,
    pub t2: u32,
    pub prefix: Option<DelegatedPrefix>,
    pub status: Option<StatusCode>,
}

impl IaPd {
    /// The delegated prefix, unless the server attached a failure status.
    pub fn granted_prefix(&self) -> Option<DelegatedPrefix> {
        match &self.status {
            Some(status) if !status.is_success() => None,
            _ => self.prefix,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    ClientId(Duid),
    ServerId(Duid),
    OptionRequest([u16; 2]),
    Preference(u8),
    /// Milliseconds since the exchange started; see [`elapsed_from_ms`]
    ElapsedTime(u16),
    StatusCode(StatusCode),
    /// Length of the skipped payload
    DnsServers(u16),
    /// Length of the skipped payload
    DomainList(u16),
    IaPd(IaPd),
}

/// Convert milliseconds since the start of the exchange into the Elapsed Time
/// value, saturating at the 16-bit maximum.
pub fn elapsed_from_ms(ms: u128) -> u16 {
    u16::try_from(ms).unwrap_or(u16::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub xid: Xid,
    pub opts: Vec<DhcpOption>,
}

impl Message {
    pub fn new(msg_type: MessageType, xid: Xid) -> Self {
        Self {
            msg_type,
            xid,
            opts: Vec::new(),
        }
    }

    pub fn client_id(&self) -> Option<&Duid> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::ClientId(id) => Some(id),
            _ => None,
        })
    }

    pub fn server_id(&self) -> Option<&Duid> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::ServerId(id) => Some(id),
            _ => None,
        })
    }

    pub fn ia_pd(&self) -> Option<&IaPd> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::IaPd(ia) => Some(ia),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<&StatusCode> {
        self.opts.iter().find_map(|opt| match opt {
            DhcpOption::StatusCode(status) => Some(status),
            _ => None,
        })
    }

    /// Prefix granted by the server, if any
    pub fn delegated_prefix(&self) -> Option<DelegatedPrefix> {
        if self.status().is_some_and(|s| !s.is_success()) {
            return None;
        }
        self.ia_pd().and_then(IaPd::granted_prefix)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.push(self.msg_type.as_u8());
        buf.extend_from_slice(&self.xid.as_bytes());
        for opt in &self.opts {
            opt.encode(&mut buf);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let raw_type = r.u8()?;
        let msg_type =
            MessageType::from_u8(raw_type).ok_or(DecodeError::UnknownMessageType(raw_type))?;
        let xid = Xid(r.array::<3>()?);

        let mut opts = Vec::new();
        while !r.is_empty() {
            opts.push(DhcpOption::decode(&mut r)?);
        }
        Ok(Self {
            msg_type,
            xid,
            opts,
        })
    }
}

const MAX_OPTION_LEN: usize = u16::MAX as usize;

fn put_header(buf: &mut Vec<u8>, code: u16, len: usize) {
    debug_assert!(len <= MAX_OPTION_LEN);
    let len = u16::try_from(len).unwrap_or(u16::MAX);
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
}

fn encode_prefix(buf: &mut Vec<u8>, prefix: &DelegatedPrefix) {
    put_header(buf, OPTION_IAPREFIX, IAPREFIX_LEN);
    buf.extend_from_slice(&prefix.preferred_lifetime.to_be_bytes());
    buf.extend_from_slice(&prefix.valid_lifetime.to_be_bytes());
    buf.push(prefix.prefix_len.min(128));
    buf.extend_from_slice(&prefix.prefix.octets());
}

/// Cut a status message so a Status Code option holding it has a body of at
/// most `budget` bytes. Cuts land on a char boundary.
fn fit_message(message: &str, budget: usize) -> &str {
    let max = budget.saturating_sub(2);
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

fn encode_status(buf: &mut Vec<u8>, status: u16, message: &str) {
    put_header(buf, OPTION_STATUS_CODE, 2 + message.len());
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(message.as_bytes());
}

impl DhcpOption {
    pub fn code(&self) -> u16 {
        match self {
            DhcpOption::ClientId(_) => OPTION_CLIENTID,
            DhcpOption::ServerId(_) => OPTION_SERVERID,
            DhcpOption::OptionRequest(_) => OPTION_ORO,
            DhcpOption::Preference(_) => OPTION_PREFERENCE,
            DhcpOption::ElapsedTime(_) => OPTION_ELAPSED_TIME,
            DhcpOption::StatusCode(_) => OPTION_STATUS_CODE,
            DhcpOption::DnsServers(_) => OPTION_DNS_SERVERS,
            DhcpOption::DomainList(_) => OPTION_DOMAIN_LIST,
            DhcpOption::IaPd(_) => OPTION_IA_PD,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            DhcpOption::ClientId(duid) | DhcpOption::ServerId(duid) => {
                put_header(buf, self.code(), Duid::LEN);
                buf.extend_from_slice(&duid.to_bytes());
            }
            DhcpOption::OptionRequest(codes) => {
                put_header(buf, OPTION_ORO, 4);
                for code in codes {
                    buf.extend_from_slice(&code.to_be_bytes());
                }
            }
            DhcpOption::Preference(pref) => {
                put_header(buf, OPTION_PREFERENCE, 1);
                buf.push(*pref);
            }
            DhcpOption::ElapsedTime(elapsed) => {
                put_header(buf, OPTION_ELAPSED_TIME, 2);
                buf.extend_from_slice(&elapsed.to_be_bytes());
            }
            DhcpOption::StatusCode(status) => encode_status(
                buf,
                status.status,
                fit_message(&status.message, MAX_OPTION_LEN),
            ),
            // payload was never kept, re-emit zeroes of the recorded length
            DhcpOption::DnsServers(len) | DhcpOption::DomainList(len) => {
                put_header(buf, self.code(), *len as usize);
                buf.resize(buf.len() + *len as usize, 0);
            }
            DhcpOption::IaPd(ia) => {
                let mut len = IA_PD_HEADER_LEN;
                if ia.prefix.is_some() {
                    len += OPTION_HEADER_LEN + IAPREFIX_LEN;
                }
                let status = ia.status.as_ref().map(|status| {
                    let budget = MAX_OPTION_LEN - len - OPTION_HEADER_LEN;
                    (status.status, fit_message(&status.message, budget))
                });
                if let Some((_, message)) = status {
                    len += OPTION_HEADER_LEN + 2 + message.len();
                }
                put_header(buf, OPTION_IA_PD, len);
                buf.extend_from_slice(&ia.iaid);
                buf.extend_from_slice(&ia.t1.to_be_bytes());
                buf.extend_from_slice(&ia.t2.to_be_bytes());
                if let Some(prefix) = &ia.prefix {
                    encode_prefix(buf, prefix);
                }
                if let Some((code, message)) = status {
                    encode_status(buf, code, message);
                }
            }
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let code = r.u16()?;
        // Preference and top-level Status Code are accepted on top of the
        // options a delegation exchange strictly needs: servers routinely
        // send both in Advertise and Reply. Anything else stays fatal.
        if !matches!(
            code,
            OPTION_CLIENTID
                | OPTION_SERVERID
                | OPTION_ORO
                | OPTION_PREFERENCE
                | OPTION_ELAPSED_TIME
                | OPTION_STATUS_CODE
                | OPTION_DNS_SERVERS
                | OPTION_DOMAIN_LIST
                | OPTION_IA_PD
        ) {
            return Err(DecodeError::UnknownOption(code));
        }
        let len = r.u16()?;
        let mut body = Reader::new(r.slice(len as usize)?);
        let expect_len = |want: usize| {
            if len as usize == want {
                Ok(())
            } else {
                Err(DecodeError::LengthMismatch { code, len })
            }
        };

        let opt = match code {
            OPTION_CLIENTID | OPTION_SERVERID => {
                expect_len(Duid::LEN)?;
                let duid = Duid::from_bytes(&body.array::<{ Duid::LEN }>()?);
                if code == OPTION_CLIENTID {
                    DhcpOption::ClientId(duid)
                } else {
                    DhcpOption::ServerId(duid)
                }
            }
            OPTION_ORO => {
                expect_len(4)?;
                DhcpOption::OptionRequest([body.u16()?, body.u16()?])
            }
            OPTION_PREFERENCE => {
                expect_len(1)?;
                DhcpOption::Preference(body.u8()?)
            }
            OPTION_ELAPSED_TIME => {
                expect_len(2)?;
                DhcpOption::ElapsedTime(body.u16()?)
            }
            OPTION_STATUS_CODE => DhcpOption::StatusCode(decode_status(code, len, &mut body)?),
            OPTION_DNS_SERVERS => DhcpOption::DnsServers(len),
            OPTION_DOMAIN_LIST => DhcpOption::DomainList(len),
            OPTION_IA_PD => DhcpOption::IaPd(decode_ia_pd(len, &mut body)?),
            _ => return Err(DecodeError::UnknownOption(code)),
        };
        Ok(opt)
    }
}

fn decode_status(code: u16, len: u16, body: &mut Reader<'_>) -> Result<StatusCode, DecodeError> {
    if (len as usize) < 2 {
        return Err(DecodeError::LengthMismatch { code, len });
    }
    let status = body.u16()?;
    let message = String::from_utf8_lossy(body.rest()?).into_owned();
    Ok(StatusCode { status, message })
}

fn decode_ia_pd(len: u16, body: &mut Reader<'_>) -> Result<IaPd, DecodeError> {
    if (len as usize) < IA_PD_HEADER_LEN {
        return Err(DecodeError::LengthMismatch {
            code: OPTION_IA_PD,
            len,
        });
    }
    let mut ia = IaPd {
        iaid: body.array::<4>()?,
        t1: body.u32()?,
        t2: body.u32()?,
        prefix: None,
        status: None,
    };

    while !body.is_empty() {
        let code = body.u16()?;
        let sub_len = body.u16()?;
        let mut sub = Reader::new(body.slice(sub_len as usize)?);
        match code {
            OPTION_IAPREFIX => {
                if sub_len as usize != IAPREFIX_LEN {
                    return Err(DecodeError::LengthMismatch { code, len: sub_len });
                }
                let prefix = DelegatedPrefix {
                    preferred_lifetime: sub.u32()?,
                    valid_lifetime: sub.u32()?,
                    prefix_len: sub.u8()?,
                    prefix: Ipv6Addr::from(sub.array::<16>()?),
                };
                if prefix.prefix_len > 128 {
                    return Err(DecodeError::InvalidPrefixLength(prefix.prefix_len));
                }
                if ia.prefix.is_some() {
                    debug!(prefix = %prefix.prefix, "ignoring additional delegated prefix");
                } else {
                    ia.prefix = Some(prefix);
                }
            }
            OPTION_STATUS_CODE => ia.status = Some(decode_status(code, sub_len, &mut sub)?),
            _ => return Err(DecodeError::UnknownOption(code)),
        }
    }
    Ok(ia)
}
