//! A user-space TCP/IP protocol stack attached to a single layer-2
//! tap-style link, with a socket-style API for in-process clients.
//!
//! The stack is organized in dependency order: [`addr`] (address/mask
//! primitives) underlies [`wire`] (per-protocol codecs), which underlies
//! [`neighbor`] (ARP/ND caches and DAD) and [`reassembly`] (IP
//! fragmentation), which together underlie [`handler`] (frame
//! demultiplex/assembly), which underlies [`socket`] and [`tcp`] (the
//! socket API and connection engine), which [`stack`] wires into a running
//! stack.
//!
//! Tap I/O, service processes, and a logging subscriber are the embedding
//! application's responsibility; [`stack::FrameSource`], [`stack::FrameSink`],
//! [`stack::Clock`], and [`stack::EntropySource`] are the seams where it
//! plugs in.

pub mod addr;
pub mod checksum;
pub mod config;
pub mod error;
pub mod handler;
pub mod neighbor;
pub mod reassembly;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod wire;

pub use config::StackConfig;
pub use error::SocketError;
pub use stack::Stack;
