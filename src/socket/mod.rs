//! Socket layer (§4.6, §9): UDP datagram sockets and TCP stream sockets
//! over a shared [`SocketTable`]. The table and its sockets never reach
//! into the stack's frame path directly; they emit through [`Transport`],
//! mirroring the inbound-direction inversion `handler::SocketDemux` gives
//! `PacketHandler`.

mod key;
mod table;
mod tcp;
mod udp;

pub use key::SocketKey;
pub use table::{SocketTable, TcbHandle};
pub use tcp::{TcpListener, TcpSocket};
pub use udp::{UdpQueue, UdpSocket, MAX_DATAGRAM_V4, MAX_DATAGRAM_V6};

use crate::addr::IpAddr;
use crate::wire::tcp::TcpSegment;
use std::time::Instant;

/// What a socket needs from the stack to emit frames and read the clock
/// and entropy source, without depending on `Stack` itself.
pub trait Transport: Send + Sync {
    fn now(&self) -> Instant;
    fn send_udp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), payload: &[u8]);
    fn send_tcp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), segments: Vec<TcpSegment>);
    fn random_u32(&self) -> u32;
}
