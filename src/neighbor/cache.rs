//! Generic neighbor cache backing both the ARP cache (IPv4→MAC) and the ND
//! cache (IPv6→MAC). §4.2: entry state machine, pending-resolution queues,
//! TTL expiry.

use crate::addr::MacAddr;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// §3 neighbor cache entry state. ARP only ever uses
/// {Incomplete, Reachable, Stale}; `Probe` is ND-only (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Probe,
}

/// Whether an `observe()` call is reporting a solicited reply (to our own
/// request) or a spontaneous advertisement (gratuitous ARP, unsolicited
/// NA). Spontaneous observations update an existing entry but never
/// create a new one out of thin air before we've asked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationSource {
    Spontaneous,
    Solicited,
}

/// Which of the two simplified state machines this cache runs (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheFlavor {
    Arp,
    NeighborDiscovery,
}

struct Entry {
    link_addr: Option<MacAddr>,
    state: NeighborState,
    last_touched: Instant,
    probes_sent: u32,
    pending: VecDeque<Vec<u8>>,
}

/// Outcome of a `lookup`.
pub enum Lookup {
    Resolved(MacAddr),
    Pending,
}

/// An action the caller must take after `resolve`/`observe`: send a
/// resolution request, flush queued frames to a learned address, or do
/// nothing.
pub enum CacheAction<P> {
    None,
    EmitResolutionRequest { target: P },
    FlushPending { link_addr: MacAddr, frames: Vec<Vec<u8>> },
}

pub struct NeighborCache<P: Eq + Hash + Copy> {
    flavor: CacheFlavor,
    reachable_time: Duration,
    probe_interval: Duration,
    max_probes: u32,
    max_pending: usize,
    entries: DashMap<P, Mutex<Entry>>,
}

impl<P: Eq + Hash + Copy> NeighborCache<P> {
    pub fn new(flavor: CacheFlavor, reachable_time: Duration, probe_interval: Duration, max_probes: u32) -> Self {
        NeighborCache {
            flavor,
            reachable_time,
            probe_interval,
            max_probes,
            max_pending: 16,
            entries: DashMap::new(),
        }
    }

    pub fn lookup(&self, proto_addr: P) -> Lookup {
        match self.entries.get(&proto_addr) {
            Some(entry) => {
                let guard = entry.lock().unwrap();
                match guard.link_addr {
                    Some(mac) => Lookup::Resolved(mac),
                    None => Lookup::Pending,
                }
            }
            None => Lookup::Pending,
        }
    }

    /// Enqueue `outbound_frame` for delivery once `proto_addr` resolves.
    /// On first miss for this address, instructs the caller to emit a
    /// resolution request.
    pub fn resolve(&self, proto_addr: P, outbound_frame: Vec<u8>, now: Instant) -> CacheAction<P> {
        let entry = self
            .entries
            .entry(proto_addr)
            .or_insert_with(|| {
                Mutex::new(Entry {
                    link_addr: None,
                    state: NeighborState::Incomplete,
                    last_touched: now,
                    probes_sent: 0,
                    pending: VecDeque::new(),
                })
            });
        let mut guard = entry.lock().unwrap();
        if let Some(mac) = guard.link_addr {
            if guard.state == NeighborState::Stale {
                guard.state = NeighborState::Probe;
                guard.probes_sent = 1;
                guard.last_touched = now;
                return CacheAction::FlushPending { link_addr: mac, frames: vec![outbound_frame] };
            }
            return CacheAction::FlushPending { link_addr: mac, frames: vec![outbound_frame] };
        }
        let was_empty = guard.pending.is_empty();
        if guard.pending.len() < self.max_pending {
            guard.pending.push_back(outbound_frame);
        }
        if was_empty {
            CacheAction::EmitResolutionRequest { target: proto_addr }
        } else {
            CacheAction::None
        }
    }

    /// Record an observed (proto_addr, link_addr) association. Returns any
    /// frames now unblocked.
    pub fn observe(&self, proto_addr: P, link_addr: MacAddr, _source: ObservationSource, now: Instant) -> Vec<Vec<u8>> {
        let entry = self.entries.entry(proto_addr).or_insert_with(|| {
            Mutex::new(Entry {
                link_addr: None,
                state: NeighborState::Incomplete,
                last_touched: now,
                probes_sent: 0,
                pending: VecDeque::new(),
            })
        });
        let mut guard = entry.lock().unwrap();
        guard.link_addr = Some(link_addr);
        guard.state = NeighborState::Reachable;
        guard.last_touched = now;
        guard.probes_sent = 0;
        guard.pending.drain(..).collect()
    }

    /// Periodic sweep: Reachable -> Stale after `reachable_time`; Probe ->
    /// evicted after `max_probes` consecutive misses (§4.2).
    pub fn evict_sweep(&self, now: Instant) {
        let mut to_remove = Vec::new();
        for item in self.entries.iter() {
            let mut guard = item.value().lock().unwrap();
            match guard.state {
                NeighborState::Reachable => {
                    if now.duration_since(guard.last_touched) >= self.reachable_time {
                        guard.state = NeighborState::Stale;
                    }
                }
                NeighborState::Probe => {
                    if now.duration_since(guard.last_touched) >= self.probe_interval {
                        if guard.probes_sent >= self.max_probes {
                            to_remove.push(*item.key());
                        } else {
                            guard.probes_sent += 1;
                            guard.last_touched = now;
                        }
                    }
                }
                NeighborState::Incomplete => {
                    if now.duration_since(guard.last_touched) >= self.probe_interval * self.max_probes.max(1) {
                        to_remove.push(*item.key());
                    }
                }
                NeighborState::Stale => {}
            }
        }
        for key in to_remove {
            self.entries.remove(&key);
        }
    }

    pub fn flavor(&self) -> CacheFlavor {
        self.flavor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ipv4Addr;

    #[test]
    fn first_miss_emits_resolution_request_then_queues() {
        let cache: NeighborCache<Ipv4Addr> =
            NeighborCache::new(CacheFlavor::Arp, Duration::from_secs(30), Duration::from_secs(1), 3);
        let now = Instant::now();
        let addr = Ipv4Addr::new([10, 0, 0, 5]);
        match cache.resolve(addr, vec![1], now) {
            CacheAction::EmitResolutionRequest { target } => assert_eq!(target, addr),
            _ => panic!("expected resolution request on first miss"),
        }
        match cache.resolve(addr, vec![2], now) {
            CacheAction::None => {}
            _ => panic!("second miss should not re-request"),
        }
    }

    #[test]
    fn observe_flushes_pending_queue() {
        let cache: NeighborCache<Ipv4Addr> =
            NeighborCache::new(CacheFlavor::Arp, Duration::from_secs(30), Duration::from_secs(1), 3);
        let now = Instant::now();
        let addr = Ipv4Addr::new([10, 0, 0, 5]);
        cache.resolve(addr, vec![1], now);
        cache.resolve(addr, vec![2], now);
        let mac = MacAddr::new([1, 2, 3, 4, 5, 6]);
        let flushed = cache.observe(addr, mac, ObservationSource::Solicited, now);
        assert_eq!(flushed, vec![vec![1], vec![2]]);
        match cache.lookup(addr) {
            Lookup::Resolved(m) => assert_eq!(m, mac),
            Lookup::Pending => panic!("expected resolved"),
        }
    }

    #[test]
    fn reachable_becomes_stale_after_timeout() {
        let cache: NeighborCache<Ipv4Addr> =
            NeighborCache::new(CacheFlavor::Arp, Duration::from_millis(10), Duration::from_secs(1), 3);
        let now = Instant::now();
        let addr = Ipv4Addr::new([10, 0, 0, 5]);
        cache.observe(addr, MacAddr::new([1; 6]), ObservationSource::Spontaneous, now);
        cache.evict_sweep(now + Duration::from_millis(20));
        // Still resolved (stale keeps the link address cached).
        assert!(matches!(cache.lookup(addr), Lookup::Resolved(_)));
    }
}
