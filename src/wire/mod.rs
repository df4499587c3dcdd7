//! Wire formats: DHCPv6 messages, ICMPv6 Router Advertisements, the IPv6
//! upper-layer checksum and Ethernet/IPv6 framing.

use dhcproto::Decoder;
use thiserror::Error;

pub mod checksum;
pub mod dhcpv6;
pub mod frame;
pub mod ra;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Option code outside the supported set. Decoding stops here.
    #[error("unknown option code {0}")]
    UnknownOption(u16),
    /// Buffer ended before a header or declared length was satisfied
    #[error("message truncated")]
    Truncated,
    /// Option length does not match the fixed length for its code
    #[error("option {code} has length {len}")]
    LengthMismatch { code: u16, len: u16 },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("invalid prefix length {0}")]
    InvalidPrefixLength(u8),
}

/// Bounds-checked big-endian reader over a byte slice.
///
/// Every read either yields the requested bytes or fails with
/// [`DecodeError::Truncated`]; nothing past the slice is ever touched.
pub(crate) struct Reader<'a> {
    inner: Decoder<'a>,
    remaining: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            inner: Decoder::new(buf),
            remaining: buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let v = self.inner.read_u8().map_err(|_| DecodeError::Truncated)?;
        self.remaining -= 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let v = self.inner.read_u16().map_err(|_| DecodeError::Truncated)?;
        self.remaining -= 2;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let v = self.inner.read_u32().map_err(|_| DecodeError::Truncated)?;
        self.remaining -= 4;
        Ok(v)
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining {
            return Err(DecodeError::Truncated);
        }
        let v = self
            .inner
            .read_slice(len)
            .map_err(|_| DecodeError::Truncated)?;
        self.remaining -= len;
        Ok(v)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }

    /// Everything not yet read
    pub fn rest(&mut self) -> Result<&'a [u8], DecodeError> {
        self.slice(self.remaining)
    }
}
