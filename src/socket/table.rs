//! Process-wide socket table (§4.4, §9): UDP bind registry plus the TCP
//! connection table, keyed by [`SocketKey`] with most-specific-first
//! lookup. Implements [`SocketDemux`] so `PacketHandler` can deliver
//! inbound datagrams/segments without knowing this type exists.

use crate::addr::IpAddr;
use crate::error::SocketError;
use crate::handler::SocketDemux;
use crate::socket::key::SocketKey;
use crate::socket::udp::UdpQueue;
use crate::socket::Transport;
use crate::tcp::{SegmentOutcome, Tcb, TcpState};
use crate::wire::tcp::TcpSegment;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const EPHEMERAL_BASE: u16 = 49152;

pub type TcbHandle = Arc<(Mutex<Tcb>, Condvar)>;

pub struct SocketTable {
    transport: Arc<dyn Transport>,
    udp: DashMap<(IpAddr, u16), Arc<UdpQueue>>,
    tcp: DashMap<SocketKey, TcbHandle>,
    next_ephemeral: AtomicU16,
    mss_default: u16,
    msl: Duration,
}

impl SocketTable {
    pub fn new(transport: Arc<dyn Transport>, mss_default: u16, msl: Duration) -> Self {
        SocketTable { transport, udp: DashMap::new(), tcp: DashMap::new(), next_ephemeral: AtomicU16::new(EPHEMERAL_BASE), mss_default, msl }
    }

    // ---- UDP -------------------------------------------------------------

    pub fn udp_bind(&self, local: (IpAddr, u16)) -> Result<Arc<UdpQueue>, SocketError> {
        if self.udp.contains_key(&local) {
            return Err(SocketError::AddressInUse);
        }
        let queue = Arc::new(UdpQueue::new());
        self.udp.insert(local, queue.clone());
        Ok(queue)
    }

    pub fn udp_unbind(&self, local: (IpAddr, u16)) {
        self.udp.remove(&local);
    }

    // ---- TCP lifecycle -----------------------------------------------------

    fn ephemeral_port(&self) -> Result<u16, SocketError> {
        for _ in 0..u16::MAX {
            let port = EPHEMERAL_BASE.wrapping_add(self.next_ephemeral.fetch_add(1, Ordering::Relaxed) % (u16::MAX - EPHEMERAL_BASE));
            if port != 0 && !self.tcp.iter().any(|e| e.key().local.1 == port) {
                return Ok(port);
            }
        }
        Err(SocketError::AddressNotAvailable)
    }

    pub fn tcp_listen(&self, local: (IpAddr, u16), backlog: usize) -> Result<SocketKey, SocketError> {
        let key = SocketKey::listening(local);
        if self.tcp.contains_key(&key) {
            return Err(SocketError::AddressInUse);
        }
        self.tcp.insert(key, Arc::new((Mutex::new(Tcb::new_listener(local, backlog)), Condvar::new())));
        Ok(key)
    }

    /// Registers a SYN_SENT TCB and emits the initial SYN. Does not block;
    /// callers wait on the returned handle's condvar for ESTABLISHED.
    pub fn tcp_connect(&self, local_ip: IpAddr, remote: (IpAddr, u16)) -> Result<(SocketKey, TcbHandle), SocketError> {
        let local_port = self.ephemeral_port()?;
        let local = (local_ip, local_port);
        let key = SocketKey::connected(local, remote);
        let iss = self.transport.random_u32();
        let now = self.transport.now();
        let tcb = Tcb::new_active(local, remote, iss, self.mss_default, self.msl, now);
        let syn = tcb.build_syn();
        let handle: TcbHandle = Arc::new((Mutex::new(tcb), Condvar::new()));
        self.tcp.insert(key, handle.clone());
        self.transport.send_tcp(local, remote, vec![syn]);
        Ok((key, handle))
    }

    pub fn tcp_handle(&self, key: &SocketKey) -> Option<TcbHandle> {
        self.tcp.get(key).map(|e| e.clone())
    }

    pub fn tcp_remove(&self, key: &SocketKey) {
        self.tcp.remove(key);
    }

    /// Drive every TCB's retransmit/persist/delayed-ack/time-wait timers.
    /// Intended to be called periodically by the stack's timer driver.
    pub fn poll_timers(&self, now: Instant) {
        let mut dead = Vec::new();
        for entry in self.tcp.iter() {
            let (key, handle) = (*entry.key(), entry.value().clone());
            let (local, remote, segments, remove) = {
                let mut tcb = handle.0.lock().unwrap();
                if tcb.state == TcpState::Listen {
                    continue;
                }
                let segments = tcb.poll_timers(now);
                (tcb.local, tcb.remote, segments, tcb.should_remove)
            };
            if !segments.is_empty() {
                self.transport.send_tcp(local, remote, segments);
            }
            if remove {
                dead.push(key);
                handle.1.notify_all();
            }
        }
        for key in dead {
            self.tcp.remove(&key);
        }
    }

    fn drive_existing(&self, key: SocketKey, handle: &TcbHandle, seg: &TcpSegment, now: Instant) {
        let was_syn_received = { handle.0.lock().unwrap().state == TcpState::SynReceived };
        let outcome: SegmentOutcome = {
            let mut tcb = handle.0.lock().unwrap();
            tcb.process_segment(seg, now)
        };
        let (local, remote, became_established, should_remove) = {
            let tcb = handle.0.lock().unwrap();
            (tcb.local, tcb.remote, was_syn_received && tcb.state == TcpState::Established, tcb.should_remove)
        };
        if !outcome.replies.is_empty() {
            self.transport.send_tcp(local, remote, outcome.replies);
        }
        if became_established {
            self.promote_to_accept_queue(local, remote, key);
        }
        handle.1.notify_all();
        if should_remove {
            self.tcp.remove(&key);
        }
    }

    fn promote_to_accept_queue(&self, local: (IpAddr, u16), remote: (IpAddr, u16), _child_key: SocketKey) {
        let listen_key = SocketKey::listening(local);
        if let Some(listener) = self.tcp.get(&listen_key) {
            let mut l = listener.0.lock().unwrap();
            l.pending_children = l.pending_children.saturating_sub(1);
            l.accept_queue.push_back((local.0, local.1, remote.0, remote.1));
            listener.1.notify_all();
        }
    }

    fn handle_syn_to_listener(&self, listen_key: SocketKey, local: (IpAddr, u16), remote: (IpAddr, u16), seg: &TcpSegment, now: Instant) {
        if !seg.flags.syn() || seg.flags.ack() || seg.flags.rst() {
            return;
        }
        let Some(listener) = self.tcp.get(&listen_key).map(|e| e.clone()) else { return };
        {
            let mut l = listener.0.lock().unwrap();
            if l.pending_children >= l.backlog.max(1) {
                return;
            }
            l.pending_children += 1;
        }
        let iss = self.transport.random_u32();
        let child = Tcb::new_syn_received(local, remote, iss, seg, self.mss_default, self.msl, now);
        let reply = child.build_syn_ack();
        let child_key = SocketKey::connected(local, remote);
        self.tcp.insert(child_key, Arc::new((Mutex::new(child), Condvar::new())));
        self.transport.send_tcp(local, remote, vec![reply]);
    }
}

impl SocketDemux for SocketTable {
    fn udp_has_listener(&self, local: (IpAddr, u16)) -> bool {
        self.udp.contains_key(&local)
    }

    fn deliver_udp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), payload: Vec<u8>) {
        if let Some(q) = self.udp.get(&local) {
            q.push(remote, payload);
        }
    }

    fn tcp_has_acceptor(&self, local: (IpAddr, u16), remote: (IpAddr, u16)) -> bool {
        SocketKey::candidates(local, remote).iter().any(|k| self.tcp.contains_key(k))
    }

    fn deliver_tcp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), segment: TcpSegment) {
        let now = self.transport.now();
        let connected_key = SocketKey::connected(local, remote);
        if let Some(handle) = self.tcp.get(&connected_key).map(|e| e.clone()) {
            self.drive_existing(connected_key, &handle, &segment, now);
            return;
        }
        let listen_key = SocketKey::listening(local);
        if self.tcp.contains_key(&listen_key) {
            self.handle_syn_to_listener(listen_key, local, remote, &segment, now);
        }
    }
}
