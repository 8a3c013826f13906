//! Stack orchestrator (§4.4, §5): owns the RX task, the TX task, the
//! multiplexed timer task, and the lifecycle of `PacketHandler` and
//! `SocketTable`. Every external dependency the core needs — frame I/O,
//! the clock, the entropy source — is a trait named only here, matching
//! §1's "external collaborators" boundary; this crate ships default
//! implementations for the clock and entropy source but no tap-device
//! I/O shim.

use crate::addr::{Host4, Host6, HostInvariantError, IpAddr, Ipv4Addr, Ipv6Addr, MacAddr, Network4, Network6};
use crate::config::StackConfig;
use crate::error::SocketError;
use crate::handler::PacketHandler;
use crate::socket::{SocketTable, TcpListener, TcpSocket, Transport, UdpSocket};
use crate::wire::ipv4::IpProtocol;
use crate::wire::tcp::TcpSegment;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Period of the multiplexed timer task (§5's "one timer task per TCB, or
/// one multiplexed timer wheel"): drives TCP retransmit/persist/delayed-ack
/// deadlines and cache/reassembly eviction.
const TIMER_TICK: Duration = Duration::from_millis(100);

/// A source of raw Ethernet frames from the tap device. `recv_frame`
/// blocks until a frame is available and returns `None` once the device
/// is closed, which is the RX task's only exit signal.
pub trait FrameSource: Send + Sync {
    fn recv_frame(&self) -> Option<Vec<u8>>;
}

/// A sink accepting frames no larger than the configured MTU plus an
/// Ethernet header.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[u8]);
}

/// A monotonic clock, abstracted so tests can supply a controllable one.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default [`Clock`], backed by [`std::time::Instant`].
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A source of pseudo-random values for initial sequence numbers and
/// protocol identifiers.
pub trait EntropySource: Send + Sync {
    fn next_u32(&self) -> u32;
}

/// The default [`EntropySource`], backed by `rand`'s thread-local RNG.
pub struct RandEntropySource;

impl EntropySource for RandEntropySource {
    fn next_u32(&self) -> u32 {
        rand::random()
    }
}

/// Bridges the socket layer's outbound direction to `PacketHandler` and
/// the TX task's outbound queue, mirroring the dependency inversion
/// `handler::SocketDemux` gives the inbound direction.
struct StackTransport {
    handler: Arc<PacketHandler>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
    outbound: Sender<Vec<u8>>,
}

impl StackTransport {
    fn emit(&self, frames: Vec<Vec<u8>>) {
        for frame in frames {
            if self.outbound.send(frame).is_err() {
                trace!("dropping outbound frame, tx task has shut down");
            }
        }
    }
}

impl Transport for StackTransport {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn send_udp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), payload: &[u8]) {
        let now = self.clock.now();
        let frames = match (local.0, remote.0) {
            (IpAddr::V4(l), IpAddr::V4(r)) => self.handler.send_udp4(l, local.1, r, remote.1, payload, now),
            (IpAddr::V6(l), IpAddr::V6(r)) => self.handler.send_udp6(l, local.1, r, remote.1, payload),
            _ => {
                warn!("dropping udp send across mismatched address families");
                return;
            }
        };
        self.emit(frames);
    }

    fn send_tcp(&self, local: (IpAddr, u16), remote: (IpAddr, u16), segments: Vec<TcpSegment>) {
        let now = self.clock.now();
        for seg in segments {
            let frames = match (local.0, remote.0) {
                (IpAddr::V4(l), IpAddr::V4(r)) => {
                    let pseudo = crate::checksum::ipv4_pseudo_header_sum(l, r, IpProtocol::Tcp.to_u8(), seg.wire_len() as u16);
                    self.handler.send_tcp4(l, r, &seg.assemble(pseudo), now)
                }
                (IpAddr::V6(l), IpAddr::V6(r)) => {
                    let pseudo = crate::checksum::ipv6_pseudo_header_sum(l, r, 6, seg.wire_len() as u32);
                    self.handler.send_tcp6(l, r, &seg.assemble(pseudo))
                }
                _ => {
                    warn!("dropping tcp send across mismatched address families");
                    continue;
                }
            };
            self.emit(frames);
        }
    }

    fn random_u32(&self) -> u32 {
        self.entropy.next_u32()
    }
}

/// The protocol stack attached to one link. Construct with [`Stack::new`],
/// assign host addresses, then call [`Stack::run`] to start the RX/TX/timer
/// tasks before using the socket API.
pub struct Stack {
    handler: Arc<PacketHandler>,
    sockets: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    frame_source: Arc<dyn FrameSource>,
    frame_sink: Arc<dyn FrameSink>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<Receiver<Vec<u8>>>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    pub fn new(
        mac: MacAddr,
        config: StackConfig,
        frame_source: Arc<dyn FrameSource>,
        frame_sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Arc<Self> {
        let handler = Arc::new(PacketHandler::new(mac, config));
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let transport: Arc<dyn Transport> =
            Arc::new(StackTransport { handler: handler.clone(), clock: clock.clone(), entropy, outbound: outbound_tx.clone() });
        let sockets = Arc::new(SocketTable::new(transport.clone(), config.tcp_mss_default, config.tcp_msl));
        Arc::new(Stack {
            handler,
            sockets,
            transport,
            clock,
            frame_source,
            frame_sink,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Convenience constructor using [`SystemClock`] and [`RandEntropySource`].
    pub fn with_defaults(mac: MacAddr, config: StackConfig, frame_source: Arc<dyn FrameSource>, frame_sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Stack::new(mac, config, frame_source, frame_sink, Arc::new(SystemClock), Arc::new(RandEntropySource))
    }

    // ---- address management (§4.2) ---------------------------------------

    pub fn add_host4(&self, address: Ipv4Addr, network: Network4, gateway: Option<Ipv4Addr>) -> Result<(), HostInvariantError> {
        let host = Host4::new(address, network, gateway, crate::addr::Origin::Static, None)?;
        self.handler.hosts4.lock().unwrap().push(host);
        Ok(())
    }

    pub fn add_host6(&self, address: Ipv6Addr, network: Network6, gateway: Option<Ipv6Addr>) -> Result<(), HostInvariantError> {
        let host = Host6::new(address, network, gateway, crate::addr::Origin::Static, None)?;
        self.handler.hosts6.lock().unwrap().push(host);
        Ok(())
    }

    // ---- sockets (§4.6) ----------------------------------------------------

    pub fn udp_bind(&self, local: (IpAddr, u16)) -> Result<UdpSocket, SocketError> {
        let queue = self.sockets.udp_bind(local)?;
        Ok(UdpSocket::new(local, queue, self.transport.clone()))
    }

    pub fn tcp_listen(&self, local: (IpAddr, u16), backlog: usize) -> Result<TcpListener, SocketError> {
        TcpListener::bind(&self.sockets, &self.transport, local, backlog)
    }

    pub fn tcp_connect(&self, local_ip: IpAddr, remote: (IpAddr, u16), timeout: Option<Duration>) -> Result<TcpSocket, SocketError> {
        TcpSocket::connect(&self.sockets, &self.transport, local_ip, remote, timeout)
    }

    // ---- lifecycle (§5) ----------------------------------------------------

    /// Spawns the RX, TX, and timer tasks. Call once after constructing the
    /// stack and assigning host addresses.
    pub fn run(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        threads.push(self.spawn_rx_task());
        threads.push(self.spawn_tx_task());
        threads.push(self.spawn_timer_task());
    }

    /// Signals the TX and timer tasks to stop. The RX task stops on its own
    /// once `frame_source` returns `None`, which the caller triggers by
    /// closing the underlying device; this only needs to be called directly
    /// if no frame is ever expected again.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Blocks until every task has exited. Intended for test harnesses and
    /// graceful-shutdown paths; long-running embeddings typically never call
    /// this.
    pub fn join(&self) {
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }

    fn spawn_rx_task(self: &Arc<Self>) -> JoinHandle<()> {
        let stack = self.clone();
        std::thread::Builder::new()
            .name("tapstack-rx".into())
            .spawn(move || {
                while let Some(frame) = stack.frame_source.recv_frame() {
                    let now = stack.clock.now();
                    let out = stack.handler.receive(&frame, now, &*stack.sockets);
                    for f in out {
                        if stack.outbound_tx.send(f).is_err() {
                            break;
                        }
                    }
                }
                stack.running.store(false, Ordering::SeqCst);
            })
            .expect("spawning rx task")
    }

    fn spawn_tx_task(self: &Arc<Self>) -> JoinHandle<()> {
        let stack = self.clone();
        let rx = self.outbound_rx.lock().unwrap().take().expect("tx task spawned twice");
        std::thread::Builder::new()
            .name("tapstack-tx".into())
            .spawn(move || {
                while stack.running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(TIMER_TICK) {
                        Ok(frame) => stack.frame_sink.send_frame(&frame),
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                while let Ok(frame) = rx.try_recv() {
                    stack.frame_sink.send_frame(&frame);
                }
            })
            .expect("spawning tx task")
    }

    fn spawn_timer_task(self: &Arc<Self>) -> JoinHandle<()> {
        let stack = self.clone();
        std::thread::Builder::new()
            .name("tapstack-timer".into())
            .spawn(move || {
                while stack.running.load(Ordering::SeqCst) {
                    std::thread::sleep(TIMER_TICK);
                    let now = stack.clock.now();
                    stack.sockets.poll_timers(now);
                    stack.handler.evict_sweep(now);
                }
            })
            .expect("spawning timer task")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Mask4;
    use std::sync::Mutex as StdMutex;

    struct LoopbackSource {
        frames: StdMutex<std::collections::VecDeque<Vec<u8>>>,
    }

    impl FrameSource for LoopbackSource {
        fn recv_frame(&self) -> Option<Vec<u8>> {
            self.frames.lock().unwrap().pop_front()
        }
    }

    struct RecordingSink {
        frames: StdMutex<Vec<Vec<u8>>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &[u8]) {
            self.frames.lock().unwrap().push(frame.to_vec());
        }
    }

    #[test]
    fn add_host4_then_udp_bind_succeeds() {
        let source = Arc::new(LoopbackSource { frames: StdMutex::new(std::collections::VecDeque::new()) });
        let sink = Arc::new(RecordingSink { frames: StdMutex::new(Vec::new()) });
        let stack = Stack::with_defaults(MacAddr::new([2, 0, 0, 0, 0, 1]), StackConfig::default(), source, sink);
        let addr = Ipv4Addr::new([192, 168, 1, 1]);
        let net = Network4::new(addr, Mask4::from_prefix_len(24).unwrap());
        stack.add_host4(addr, net, None).unwrap();
        let sock = stack.udp_bind((IpAddr::V4(addr), 7)).unwrap();
        assert_eq!(sock.local_addr(), (IpAddr::V4(addr), 7));
    }

    #[test]
    fn rx_task_stops_when_frame_source_is_exhausted() {
        let source = Arc::new(LoopbackSource { frames: StdMutex::new(std::collections::VecDeque::new()) });
        let sink = Arc::new(RecordingSink { frames: StdMutex::new(Vec::new()) });
        let stack = Stack::with_defaults(MacAddr::new([2, 0, 0, 0, 0, 1]), StackConfig::default(), source, sink);
        stack.run();
        stack.join();
    }
}
