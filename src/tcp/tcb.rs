//! Transmission Control Block (§3, §4.5): per-connection state machine,
//! send/receive buffers, congestion control, and timers. One `Tcb` is
//! either a LISTEN socket tracking its backlog, or a connection somewhere
//! between `SynSent`/`SynReceived` and `TimeWait`.

use crate::addr::{IpAddr, Ipv4Addr, Ipv6Addr};
use crate::error::SocketError;
use crate::tcp::retransmit::{CongestionController, RttEstimator};
use crate::tcp::state::{seq_gt, seq_gte, seq_lt, TcpState};
use crate::tcp::timers::Timers;
use crate::wire::tcp::{TcpFlags, TcpOption, TcpSegment};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Our advertised window-scale shift (RFC 7323); the receive buffer cap
/// below is sized so the unscaled window rarely saturates at 65535.
pub const OUR_WINDOW_SHIFT: u8 = 7;
pub const RECV_BUFFER_CAP: usize = 8 * 1024 * 1024;
pub const MAX_SEND_BUFFER: usize = 1024 * 1024;
const MAX_OOO_SEGMENTS: usize = 64;

/// What processing one inbound segment produced.
#[derive(Default)]
pub struct SegmentOutcome {
    pub replies: Vec<TcpSegment>,
    pub newly_readable: bool,
}

pub struct Tcb {
    pub state: TcpState,
    pub local: (IpAddr, u16),
    pub remote: (IpAddr, u16),

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub irs: u32,

    pub our_mss: u16,
    pub peer_mss: u16,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub window_scaling: bool,
    pub sack_permitted: bool,

    pub cc: CongestionController,
    pub rtt: RttEstimator,
    rtt_probe: Option<(u32, Instant)>,
    dup_ack_count: u32,
    pub last_send: Instant,

    pub send_buf: VecDeque<u8>,
    pub recv_buf: VecDeque<u8>,
    ooo: BTreeMap<u32, Vec<u8>>,

    pub timers: Timers,
    unacked_segments_since_ack: u32,

    pub fin_sent_seq: Option<u32>,
    pub peer_fin_seq: Option<u32>,
    pub reset: bool,
    pub should_remove: bool,
    msl: Duration,

    /// LISTEN-only bookkeeping: children that reached ESTABLISHED and are
    /// waiting for `accept`, and a count of not-yet-established children
    /// charged against `backlog`.
    pub accept_queue: VecDeque<(IpAddr, u16, IpAddr, u16)>,
    pub pending_children: usize,
    pub backlog: usize,
}

fn unspecified_like(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::new([0, 0, 0, 0])),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new([0; 16])),
    }
}

impl Tcb {
    fn blank(local: (IpAddr, u16), remote: (IpAddr, u16), our_mss: u16, msl: Duration, now: Instant) -> Self {
        Tcb {
            state: TcpState::Closed,
            local,
            remote,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss: 0,
            rcv_nxt: 0,
            irs: 0,
            our_mss,
            peer_mss: our_mss,
            snd_wscale: 0,
            rcv_wscale: 0,
            window_scaling: false,
            sack_permitted: false,
            cc: CongestionController::new(our_mss),
            rtt: RttEstimator::new(),
            rtt_probe: None,
            dup_ack_count: 0,
            last_send: now,
            send_buf: VecDeque::new(),
            recv_buf: VecDeque::new(),
            ooo: BTreeMap::new(),
            timers: Timers::default(),
            unacked_segments_since_ack: 0,
            fin_sent_seq: None,
            peer_fin_seq: None,
            reset: false,
            should_remove: false,
            msl,
            accept_queue: VecDeque::new(),
            pending_children: 0,
            backlog: 0,
        }
    }

    pub fn new_listener(local: (IpAddr, u16), backlog: usize) -> Self {
        let remote = (unspecified_like(local.0), 0);
        let mut tcb = Tcb::blank(local, remote, 0, Duration::ZERO, Instant::now());
        tcb.state = TcpState::Listen;
        tcb.backlog = backlog;
        tcb
    }

    /// Active open (§4.5 "CLOSED + active open → SYN_SENT, emit SYN").
    pub fn new_active(local: (IpAddr, u16), remote: (IpAddr, u16), iss: u32, our_mss: u16, msl: Duration, now: Instant) -> Self {
        let mut tcb = Tcb::blank(local, remote, our_mss, msl, now);
        tcb.state = TcpState::SynSent;
        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss.wrapping_add(1);
        tcb.rcv_wscale = OUR_WINDOW_SHIFT;
        tcb.window_scaling = true;
        tcb.sack_permitted = true;
        tcb.timers.arm_retransmit(now, tcb.rtt.rto());
        tcb
    }

    pub fn build_syn(&self) -> TcpSegment {
        TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: self.iss,
            ack: 0,
            flags: TcpFlags::new().with_syn(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: vec![TcpOption::Mss(self.our_mss), TcpOption::WindowScale(self.rcv_wscale), TcpOption::SackPermitted],
            payload: Vec::new(),
        }
    }

    /// Passive open (§4.5 "LISTEN + SYN → SYN_RECEIVED, reply SYN+ACK").
    pub fn new_syn_received(local: (IpAddr, u16), remote: (IpAddr, u16), iss: u32, seg: &TcpSegment, our_mss: u16, msl: Duration, now: Instant) -> Self {
        let mut tcb = Tcb::blank(local, remote, our_mss, msl, now);
        tcb.state = TcpState::SynReceived;
        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss.wrapping_add(1);
        tcb.irs = seg.seq;
        tcb.rcv_nxt = seg.seq.wrapping_add(1);
        tcb.peer_mss = seg.mss().unwrap_or(our_mss);
        if let Some(shift) = seg.window_scale() {
            tcb.snd_wscale = shift;
            tcb.rcv_wscale = OUR_WINDOW_SHIFT;
            tcb.window_scaling = true;
        }
        tcb.sack_permitted = seg.sack_permitted();
        tcb.snd_wnd = seg.window as u32; // SYN's own window is never scaled (RFC 7323)
        tcb.cc = CongestionController::new(tcb.effective_mss());
        tcb.timers.arm_retransmit(now, tcb.rtt.rto());
        tcb
    }

    pub fn build_syn_ack(&self) -> TcpSegment {
        let mut options = vec![TcpOption::Mss(self.our_mss)];
        if self.window_scaling {
            options.push(TcpOption::WindowScale(self.rcv_wscale));
        }
        if self.sack_permitted {
            options.push(TcpOption::SackPermitted);
        }
        TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: self.iss,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_syn(true).with_ack(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options,
            payload: Vec::new(),
        }
    }

    fn effective_mss(&self) -> u16 {
        self.our_mss.min(self.peer_mss).max(1)
    }

    fn rcv_wnd(&self) -> u32 {
        let occupied = self.recv_buf.len() + self.ooo.values().map(Vec::len).sum::<usize>();
        RECV_BUFFER_CAP.saturating_sub(occupied) as u32
    }

    pub fn advertised_window(&self) -> u16 {
        (self.rcv_wnd() >> self.rcv_wscale).min(u16::MAX as u32) as u16
    }

    /// §4.5 segment acceptance test: does `[seg.seq, seg.seq+len)` intersect
    /// `[RCV.NXT, RCV.NXT+RCV.WND)`?
    pub fn segment_acceptable(&self, seg: &TcpSegment) -> bool {
        let window = self.rcv_wnd().max(1);
        let seg_len = seg.payload.len() as u32 + seg.flags.fin() as u32;
        if seg_len == 0 {
            seq_gte(seg.seq, self.rcv_nxt) && seq_lt(seg.seq, self.rcv_nxt.wrapping_add(window))
        } else {
            let end = seg.seq.wrapping_add(seg_len);
            seq_lt(seg.seq, self.rcv_nxt.wrapping_add(window)) && seq_gt(end, self.rcv_nxt)
        }
    }

    fn build_ack(&mut self) -> TcpSegment {
        self.timers.disarm_delayed_ack();
        self.unacked_segments_since_ack = 0;
        TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_ack(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    fn build_reset_reply(&self, seg: &TcpSegment) -> TcpSegment {
        let (seq, ack) = if seg.flags.ack() {
            (seg.ack, 0)
        } else {
            (0, seg.seq.wrapping_add(seg.payload.len() as u32).wrapping_add(seg.flags.syn() as u32).wrapping_add(seg.flags.fin() as u32))
        };
        TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq,
            ack,
            flags: TcpFlags::new().with_rst(true).with_ack(!seg.flags.ack()),
            window: 0,
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Process one inbound segment for a connection already past the
    /// handshake-initiation states (everything except LISTEN/CLOSED).
    pub fn process_segment(&mut self, seg: &TcpSegment, now: Instant) -> SegmentOutcome {
        let mut out = SegmentOutcome::default();
        if seg.flags.rst() {
            self.reset = true;
            self.state = TcpState::Closed;
            self.should_remove = true;
            return out;
        }
        match self.state {
            TcpState::SynSent => self.on_syn_sent(seg, &mut out),
            TcpState::SynReceived => self.on_syn_received(seg, now, &mut out),
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing | TcpState::CloseWait | TcpState::LastAck | TcpState::TimeWait => {
                self.on_synchronized(seg, now, &mut out);
            }
            TcpState::Listen | TcpState::Closed => {}
        }
        out
    }

    fn on_syn_sent(&mut self, seg: &TcpSegment, out: &mut SegmentOutcome) {
        if seg.flags.ack() && seg.ack != self.snd_nxt {
            out.replies.push(self.build_reset_reply(seg));
            return;
        }
        if seg.flags.syn() && seg.flags.ack() {
            self.irs = seg.seq;
            self.rcv_nxt = seg.seq.wrapping_add(1);
            self.snd_una = seg.ack;
            self.timers.disarm_retransmit();
            self.peer_mss = seg.mss().unwrap_or(self.our_mss);
            if let Some(shift) = seg.window_scale() {
                self.snd_wscale = shift;
            } else {
                self.window_scaling = false;
                self.rcv_wscale = 0;
            }
            self.sack_permitted &= seg.sack_permitted();
            self.snd_wnd = seg.window as u32; // SYN-ACK window is never scaled
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
            self.cc = CongestionController::new(self.effective_mss());
            self.state = TcpState::Established;
            out.replies.push(self.build_ack());
        }
        // A bare SYN (simultaneous open) or a non-SYN segment here is
        // outside this crate's scope; ignored rather than mishandled.
    }

    fn on_syn_received(&mut self, seg: &TcpSegment, now: Instant, out: &mut SegmentOutcome) {
        if seg.flags.syn() && !seg.flags.ack() {
            out.replies.push(self.build_syn_ack());
            return;
        }
        if !seg.flags.ack() {
            return;
        }
        if seg.ack != self.snd_nxt {
            out.replies.push(self.build_reset_reply(seg));
            return;
        }
        self.snd_una = seg.ack;
        self.snd_wnd = if self.window_scaling { (seg.window as u32) << self.snd_wscale } else { seg.window as u32 };
        self.snd_wl1 = seg.seq;
        self.snd_wl2 = seg.ack;
        self.timers.disarm_retransmit();
        self.state = TcpState::Established;
        if self.accept_data(seg) {
            out.newly_readable = true;
        }
        if seg.flags.fin() {
            self.process_fin(seg, now, out);
        } else {
            self.decide_ack(seg, now, out);
        }
    }

    fn on_synchronized(&mut self, seg: &TcpSegment, now: Instant, out: &mut SegmentOutcome) {
        let acceptable = self.segment_acceptable(seg);
        if seg.flags.ack() {
            self.process_ack(seg, now, out);
        }
        if !acceptable {
            if !seg.payload.is_empty() || seg.flags.fin() {
                out.replies.push(self.build_ack());
            }
            return;
        }
        if self.accept_data(seg) {
            out.newly_readable = true;
        }
        let fin_processed = seg.flags.fin() && {
            self.process_fin(seg, now, out);
            true
        };
        if !fin_processed {
            self.decide_ack(seg, now, out);
        }
    }

    fn process_ack(&mut self, seg: &TcpSegment, now: Instant, out: &mut SegmentOutcome) {
        use crate::tcp::state::seq_lte;
        if seq_gt(seg.ack, self.snd_una) && seq_lte(seg.ack, self.snd_nxt) {
            let acked = seg.ack.wrapping_sub(self.snd_una) as usize;
            self.snd_una = seg.ack;
            let drain = acked.min(self.send_buf.len());
            self.send_buf.drain(..drain);
            self.snd_wnd = if self.window_scaling { (seg.window as u32) << self.snd_wscale } else { seg.window as u32 };
            self.snd_wl1 = seg.seq;
            self.snd_wl2 = seg.ack;
            self.cc.on_ack();
            self.dup_ack_count = 0;
            if let Some((probe_seq, sent_at)) = self.rtt_probe {
                if seq_gte(seg.ack, probe_seq.wrapping_add(1)) {
                    self.rtt.sample(now.saturating_duration_since(sent_at));
                    self.rtt_probe = None;
                }
            }
            if self.snd_una == self.snd_nxt {
                self.timers.disarm_retransmit();
            } else {
                self.timers.arm_retransmit(now, self.rtt.rto());
            }
            match self.state {
                TcpState::FinWait1 => {
                    if let Some(fin_seq) = self.fin_sent_seq {
                        if seq_gte(seg.ack, fin_seq.wrapping_add(1)) {
                            self.state = TcpState::FinWait2;
                            self.fin_sent_seq = None;
                        }
                    }
                }
                TcpState::Closing => {
                    if let Some(fin_seq) = self.fin_sent_seq {
                        if seq_gte(seg.ack, fin_seq.wrapping_add(1)) {
                            self.state = TcpState::TimeWait;
                            self.fin_sent_seq = None;
                            self.timers.arm_time_wait(now, self.msl);
                        }
                    }
                }
                TcpState::LastAck => {
                    if let Some(fin_seq) = self.fin_sent_seq {
                        if seq_gte(seg.ack, fin_seq.wrapping_add(1)) {
                            self.state = TcpState::Closed;
                            self.should_remove = true;
                        }
                    }
                }
                _ => {}
            }
        } else if seg.ack == self.snd_una && seg.payload.is_empty() && !seg.flags.syn() && !seg.flags.fin() && self.snd_una != self.snd_nxt {
            // RFC 5681 duplicate ACK.
            self.dup_ack_count += 1;
            if self.dup_ack_count == 3 {
                if let Some(rexmit) = self.fast_retransmit_segment(now) {
                    out.replies.push(rexmit);
                }
            }
        } else if seg.ack == self.snd_una {
            self.snd_wnd = if self.window_scaling { (seg.window as u32) << self.snd_wscale } else { seg.window as u32 };
        }
    }

    fn fast_retransmit_segment(&mut self, now: Instant) -> Option<TcpSegment> {
        if self.send_buf.is_empty() {
            return None;
        }
        self.dup_ack_count = 0;
        let len = self.send_buf.len().min(self.effective_mss() as usize);
        let data: Vec<u8> = self.send_buf.iter().take(len).copied().collect();
        self.last_send = now;
        Some(TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: self.snd_una,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_ack(true).with_psh(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: Vec::new(),
            payload: data,
        })
    }

    fn accept_data(&mut self, seg: &TcpSegment) -> bool {
        if seg.payload.is_empty() {
            return false;
        }
        self.unacked_segments_since_ack += 1;
        if seg.seq != self.rcv_nxt {
            if seq_gt(seg.seq, self.rcv_nxt) && self.ooo.len() < MAX_OOO_SEGMENTS {
                self.ooo.entry(seg.seq).or_insert_with(|| seg.payload.clone());
            }
            return false;
        }
        self.recv_buf.extend(seg.payload.iter().copied());
        self.rcv_nxt = self.rcv_nxt.wrapping_add(seg.payload.len() as u32);
        while let Some((&seq, _)) = self.ooo.iter().next() {
            if seq != self.rcv_nxt {
                break;
            }
            let data = self.ooo.remove(&seq).unwrap();
            self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
            self.recv_buf.extend(data);
        }
        true
    }

    fn process_fin(&mut self, seg: &TcpSegment, now: Instant, out: &mut SegmentOutcome) {
        if self.peer_fin_seq.is_some() {
            out.replies.push(self.build_ack());
            return;
        }
        let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
        if self.rcv_nxt != fin_seq {
            return; // gap before the FIN; wait for the missing bytes
        }
        self.peer_fin_seq = Some(fin_seq);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.state = match self.state {
            TcpState::Established => TcpState::CloseWait,
            TcpState::FinWait1 => TcpState::Closing,
            TcpState::FinWait2 => {
                self.timers.arm_time_wait(now, self.msl);
                TcpState::TimeWait
            }
            TcpState::TimeWait => {
                self.timers.arm_time_wait(now, self.msl);
                TcpState::TimeWait
            }
            other => other,
        };
        out.replies.push(self.build_ack());
    }

    /// §4.5 delayed ACK: ack within 200ms, or immediately on the second
    /// in-order data segment since the last ack.
    fn decide_ack(&mut self, seg: &TcpSegment, now: Instant, out: &mut SegmentOutcome) {
        if seg.payload.is_empty() {
            return;
        }
        if self.unacked_segments_since_ack >= 2 {
            out.replies.push(self.build_ack());
        } else {
            self.timers.arm_delayed_ack(now);
        }
    }

    /// Queue application bytes for transmission; does not itself transmit.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SocketError> {
        if self.reset {
            return Err(SocketError::ConnectionReset);
        }
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return Err(SocketError::NotConnected);
        }
        let room = MAX_SEND_BUFFER.saturating_sub(self.send_buf.len());
        let n = room.min(data.len());
        self.send_buf.extend(data[..n].iter().copied());
        Ok(n)
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        if self.recv_buf.is_empty() && self.reset {
            return Err(SocketError::ConnectionReset);
        }
        let n = self.recv_buf.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.recv_buf.drain(..n)) {
            *slot = byte;
        }
        if n == 0 {
            let eof = self.peer_fin_seq.is_some_and(|fin| seq_gte(self.rcv_nxt, fin.wrapping_add(1)));
            if eof {
                return Ok(0);
            }
            return Err(SocketError::WouldBlock);
        }
        Ok(n)
    }

    /// Emit as many fresh data segments as the congestion and send windows
    /// currently allow, starting from the first unsent byte.
    pub fn flush_send(&mut self, now: Instant) -> Vec<TcpSegment> {
        let mut out = Vec::new();
        let usable = self.cc.usable_window(self.snd_wnd);
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        let mut available = usable.saturating_sub(in_flight);
        let mss = self.effective_mss() as u32;
        let mut offset = in_flight as usize;
        while available > 0 && offset < self.send_buf.len() {
            let chunk_len = (available.min(mss) as usize).min(self.send_buf.len() - offset);
            if chunk_len == 0 {
                break;
            }
            let data: Vec<u8> = self.send_buf.iter().skip(offset).take(chunk_len).copied().collect();
            let seq = self.snd_nxt;
            let last_chunk = offset + chunk_len == self.send_buf.len();
            out.push(TcpSegment {
                src_port: self.local.1,
                dst_port: self.remote.1,
                seq,
                ack: self.rcv_nxt,
                flags: TcpFlags::new().with_ack(true).with_psh(last_chunk),
                window: self.advertised_window(),
                urgent_pointer: 0,
                options: Vec::new(),
                payload: data,
            });
            if self.rtt_probe.is_none() {
                self.rtt_probe = Some((seq, now));
            }
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk_len as u32);
            self.last_send = now;
            if self.timers.retransmit_deadline.is_none() {
                self.timers.arm_retransmit(now, self.rtt.rto());
            }
            offset += chunk_len;
            available -= chunk_len as u32;
        }
        if self.snd_wnd == 0 && offset < self.send_buf.len() && self.timers.persist_deadline.is_none() {
            self.timers.arm_persist(now);
        }
        out
    }

    /// Begin closing (§4.5: "ESTABLISHED + close() → FIN_WAIT_1, emit FIN";
    /// "CLOSE_WAIT + close() → LAST_ACK, emit FIN"). Any data still sitting
    /// behind a closed send window at the moment of `close` is not sent —
    /// callers are expected to drain `send` before closing.
    pub fn close(&mut self, now: Instant) -> Vec<TcpSegment> {
        let mut out = self.flush_send(now);
        let new_state = match self.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return out,
        };
        self.state = new_state;
        let fin_seq = self.snd_nxt;
        self.fin_sent_seq = Some(fin_seq);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.last_send = now;
        self.timers.arm_retransmit(now, self.rtt.rto());
        out.push(TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: fin_seq,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_fin(true).with_ack(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        });
        out
    }

    fn retransmit_fin_if_pending(&mut self, now: Instant) -> Option<TcpSegment> {
        let fin_seq = self.fin_sent_seq?;
        if seq_gte(self.snd_una, fin_seq.wrapping_add(1)) {
            return None;
        }
        self.last_send = now;
        Some(TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: fin_seq,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_fin(true).with_ack(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: Vec::new(),
            payload: Vec::new(),
        })
    }

    fn build_probe(&mut self, now: Instant) -> TcpSegment {
        self.last_send = now;
        let byte = self.send_buf.front().copied().into_iter().collect::<Vec<u8>>();
        TcpSegment {
            src_port: self.local.1,
            dst_port: self.remote.1,
            seq: self.snd_una,
            ack: self.rcv_nxt,
            flags: TcpFlags::new().with_ack(true),
            window: self.advertised_window(),
            urgent_pointer: 0,
            options: Vec::new(),
            payload: byte,
        }
    }

    /// Drive retransmit/persist/delayed-ack/time-wait deadlines. Returns
    /// segments to emit; sets `should_remove` once TIME_WAIT expires.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<TcpSegment> {
        let mut out = Vec::new();

        if let Some(deadline) = self.timers.delayed_ack_deadline {
            if now >= deadline {
                out.push(self.build_ack());
            }
        }

        if let Some(deadline) = self.timers.retransmit_deadline {
            if now >= deadline {
                self.timers.disarm_retransmit();
                let flight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.cc.on_timeout(flight);
                self.rtt.backoff();
                self.rtt_probe = None;
                self.snd_nxt = self.snd_una;
                out.extend(self.flush_send(now));
                if let Some(fin) = self.retransmit_fin_if_pending(now) {
                    out.push(fin);
                }
            }
        }

        if self.snd_wnd != 0 {
            self.timers.disarm_persist();
        } else if let Some(deadline) = self.timers.persist_deadline {
            if now >= deadline && !self.send_buf.is_empty() {
                self.timers.arm_persist(now);
                out.push(self.build_probe(now));
            }
        }

        if let Some(deadline) = self.timers.time_wait_deadline {
            if now >= deadline {
                self.state = TcpState::Closed;
                self.should_remove = true;
            }
        }

        out
    }
}
