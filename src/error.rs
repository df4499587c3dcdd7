use std::io;

use compact_str::CompactString;
use thiserror::Error;

use crate::{platform::PlatformError, wire::DecodeError, Xid};

#[derive(Debug, Error)]
pub enum Error {
    /// No link matched the selection predicate within the polling bound
    #[error("no network devices found")]
    NoDevicesFound,

    /// Links exist but none is usable (wrong name, MTU too small, bring-up failed)
    #[error("no suitable network device")]
    NoSuitableDevice,

    /// Candidates are open but none reported carrier. Advisory: the exchange
    /// still runs.
    #[error("timed out waiting for carrier")]
    NoCarrier,

    #[error("allocation failure")]
    AllocationFailure,

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("transaction {got} does not match {expected}")]
    NotForUs { got: Xid, expected: Xid },

    #[error("no reply from any DHCPv6 server")]
    ExchangeTimedOut,

    #[error("transmit on {link} failed: {source}")]
    TransmitFailure {
        link: CompactString,
        source: PlatformError,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}
