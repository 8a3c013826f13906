//! Error kinds that cross the parser boundary (§7).
//!
//! Integrity failures are wire malformedness (length, checksum,
//! structural). Sanity failures are semantic RFC violations that cannot be
//! expressed as a length check. Both are per-protocol, drop the frame, and
//! never propagate to user sockets; only `SocketError` is user-visible.

use thiserror::Error;

/// A protocol tag used to attribute a dropped-frame statistic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ethernet,
    Arp,
    Ipv4,
    Ipv6,
    Icmpv4,
    Icmpv6,
    Udp,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Ethernet => "ethernet",
            Protocol::Arp => "arp",
            Protocol::Ipv4 => "ipv4",
            Protocol::Ipv6 => "ipv6",
            Protocol::Icmpv4 => "icmpv4",
            Protocol::Icmpv6 => "icmpv6",
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        };
        f.write_str(s)
    }
}

/// Wire malformedness: length bounds, structural well-formedness, checksum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{protocol} integrity failure: {reason}")]
pub struct IntegrityError {
    pub protocol: Protocol,
    pub reason: &'static str,
}

impl IntegrityError {
    pub fn new(protocol: Protocol, reason: &'static str) -> Self {
        IntegrityError { protocol, reason }
    }
}

/// RFC-level semantic constraint violation, logged distinctly from
/// integrity failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{protocol} sanity failure: {reason}")]
pub struct SanityError {
    pub protocol: Protocol,
    pub reason: &'static str,
}

impl SanityError {
    pub fn new(protocol: Protocol, reason: &'static str) -> Self {
        SanityError { protocol, reason }
    }
}

/// Either class of drop, for call sites that just need to log-and-drop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Sanity(#[from] SanityError),
}

/// User-visible socket errors (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("address in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("timed out")]
    TimedOut,
    #[error("not connected")]
    NotConnected,
    #[error("would block")]
    WouldBlock,
    #[error("message too long")]
    MessageTooLong,
    #[error("no route to host")]
    NoRoute,
}
