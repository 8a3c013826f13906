//! UDP sockets (§4.6): `bind`/`sendto`/`recvfrom` over the shared socket
//! table. A bound socket owns a [`UdpQueue`] that `SocketTable::deliver_udp`
//! feeds from the receive path.

use crate::addr::IpAddr;
use crate::error::SocketError;
use crate::socket::Transport;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const MAX_DATAGRAM_V4: usize = 65507;
pub const MAX_DATAGRAM_V6: usize = 65527;

pub struct UdpQueue {
    datagrams: Mutex<VecDeque<((IpAddr, u16), Vec<u8>)>>,
    ready: Condvar,
}

impl UdpQueue {
    pub fn new() -> Self {
        UdpQueue { datagrams: Mutex::new(VecDeque::new()), ready: Condvar::new() }
    }

    pub fn push(&self, remote: (IpAddr, u16), payload: Vec<u8>) {
        self.datagrams.lock().unwrap().push_back((remote, payload));
        self.ready.notify_one();
    }
}

impl Default for UdpQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound UDP endpoint.
pub struct UdpSocket {
    local: (IpAddr, u16),
    queue: Arc<UdpQueue>,
    transport: Arc<dyn Transport>,
}

impl UdpSocket {
    pub fn new(local: (IpAddr, u16), queue: Arc<UdpQueue>, transport: Arc<dyn Transport>) -> Self {
        UdpSocket { local, queue, transport }
    }

    pub fn local_addr(&self) -> (IpAddr, u16) {
        self.local
    }

    pub fn max_datagram_len(&self) -> usize {
        match self.local.0 {
            IpAddr::V4(_) => MAX_DATAGRAM_V4,
            IpAddr::V6(_) => MAX_DATAGRAM_V6,
        }
    }

    pub fn sendto(&self, data: &[u8], remote: (IpAddr, u16)) -> Result<usize, SocketError> {
        if data.len() > self.max_datagram_len() {
            return Err(SocketError::MessageTooLong);
        }
        self.transport.send_udp(self.local, remote, data);
        Ok(data.len())
    }

    /// Blocks until a datagram arrives or `timeout` elapses.
    pub fn recvfrom(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<(usize, (IpAddr, u16)), SocketError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.queue.datagrams.lock().unwrap();
        loop {
            if let Some((remote, payload)) = guard.pop_front() {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                return Ok((n, remote));
            }
            match deadline {
                None => guard = self.queue.ready.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SocketError::TimedOut);
                    }
                    let (next, result) = self.queue.ready.wait_timeout(guard, deadline - now).unwrap();
                    guard = next;
                    if result.timed_out() && guard.is_empty() {
                        return Err(SocketError::TimedOut);
                    }
                }
            }
        }
    }
}
