//! IPv4/IPv6 fragment reassembly (§4.3): per-flow holding buffers keyed by
//! (src, dst, id), timeout-based eviction, overlap-tolerant last-writer-wins
//! merge.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_FLOW_TIMEOUT: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Flow {
    header: Vec<u8>,
    last_seen: Instant,
    last_fragment_seen: bool,
    total_len: Option<usize>,
    /// offset -> payload slice. A `BTreeMap` keeps offsets ordered so the
    /// "covers [0, total_len) without gaps" check is a single linear scan.
    pieces: BTreeMap<usize, Vec<u8>>,
}

impl Flow {
    fn new(header: Vec<u8>, now: Instant) -> Self {
        Flow {
            header,
            last_seen: now,
            last_fragment_seen: false,
            total_len: None,
            pieces: BTreeMap::new(),
        }
    }

    fn insert(&mut self, offset: usize, data: Vec<u8>, more_fragments: bool, now: Instant) {
        self.last_seen = now;
        if !more_fragments {
            self.last_fragment_seen = true;
            self.total_len = Some(offset + data.len());
        }
        // Overlapping fragments: last writer wins (§4.3).
        self.pieces.insert(offset, data);
    }

    /// `Some(bytes)` once `last_fragment_seen` and the ordered offsets
    /// cover [0, total_len) with no gap.
    fn try_assemble(&self) -> Option<Vec<u8>> {
        let total_len = self.total_len?;
        if !self.last_fragment_seen {
            return None;
        }
        let mut out = vec![0u8; total_len];
        let mut covered = 0usize;
        for (&offset, data) in &self.pieces {
            if offset > covered {
                return None; // gap
            }
            let end = offset + data.len();
            if end > covered {
                out[offset..end.min(total_len)].copy_from_slice(&data[..end.min(total_len) - offset]);
                covered = end.max(covered);
            }
        }
        if covered < total_len {
            return None;
        }
        Some(out)
    }
}

/// A fragment reassembly table keyed by `K` (e.g. `(Ipv4Addr, Ipv4Addr, u16)`
/// for IPv4, `(Ipv6Addr, Ipv6Addr, u32)` for IPv6).
pub struct ReassemblyTable<K: Eq + Hash + Copy> {
    timeout: Duration,
    flows: DashMap<K, Flow>,
}

impl<K: Eq + Hash + Copy> ReassemblyTable<K> {
    pub fn new(timeout: Duration) -> Self {
        ReassemblyTable { timeout, flows: DashMap::new() }
    }

    /// Record one fragment. Returns the reassembled datagram (header bytes,
    /// body bytes) once complete, dropping the flow afterward.
    pub fn insert_fragment(
        &self,
        key: K,
        header: &[u8],
        offset: usize,
        data: &[u8],
        more_fragments: bool,
        now: Instant,
    ) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut done = None;
        {
            let mut flow = self
                .flows
                .entry(key)
                .or_insert_with(|| Flow::new(header.to_vec(), now));
            flow.insert(offset, data.to_vec(), more_fragments, now);
            if let Some(assembled) = flow.try_assemble() {
                done = Some((flow.header.clone(), assembled));
            }
        }
        if done.is_some() {
            self.flows.remove(&key);
        }
        done
    }

    /// Periodic sweep (§4.3: "every second"): evict flows older than the
    /// configured timeout.
    pub fn evict_sweep(&self, now: Instant) {
        self.flows.retain(|_, flow| now.duration_since(flow.last_seen) < self.timeout);
    }

    pub fn pending_flows(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_three_in_order_fragments() {
        let table: ReassemblyTable<(u32, u16)> = ReassemblyTable::new(DEFAULT_FLOW_TIMEOUT);
        let now = Instant::now();
        let key = (1, 42);
        assert!(table.insert_fragment(key, b"hdr", 0, &[1u8; 1480], true, now).is_none());
        assert!(table.insert_fragment(key, b"hdr", 1480, &[2u8; 1480], true, now).is_none());
        let result = table.insert_fragment(key, b"hdr", 2960, &[3u8; 40], false, now);
        let (header, body) = result.unwrap();
        assert_eq!(header, b"hdr");
        assert_eq!(body.len(), 3000);
        assert_eq!(&body[0..1480], &[1u8; 1480][..]);
        assert_eq!(&body[2960..3000], &[3u8; 40][..]);
    }

    #[test]
    fn gap_delays_delivery_until_filled() {
        let table: ReassemblyTable<(u32, u16)> = ReassemblyTable::new(DEFAULT_FLOW_TIMEOUT);
        let now = Instant::now();
        let key = (1, 7);
        assert!(table.insert_fragment(key, b"h", 0, &[1u8; 100], true, now).is_none());
        assert!(table.insert_fragment(key, b"h", 200, &[2u8; 50], false, now).is_none());
        let result = table.insert_fragment(key, b"h", 100, &[3u8; 100], true, now);
        assert!(result.is_some());
    }

    #[test]
    fn delivering_the_same_fragment_twice_is_idempotent() {
        let table: ReassemblyTable<(u32, u16)> = ReassemblyTable::new(DEFAULT_FLOW_TIMEOUT);
        let now = Instant::now();
        let key = (2, 1);
        table.insert_fragment(key, b"h", 0, &[9u8; 10], false, now);
        let first = table.insert_fragment(key, b"h", 0, &[9u8; 10], false, now);
        assert!(first.is_some());
        let key2 = (2, 2);
        table.insert_fragment(key2, b"h", 0, &[9u8; 10], false, now);
        let second = table.insert_fragment(key2, b"h", 0, &[9u8; 10], false, now);
        assert_eq!(first, second);
    }

    #[test]
    fn eviction_drops_stale_flows() {
        let table: ReassemblyTable<(u32, u16)> = ReassemblyTable::new(Duration::from_millis(10));
        let now = Instant::now();
        table.insert_fragment((1, 1), b"h", 0, &[1u8; 10], true, now);
        assert_eq!(table.pending_flows(), 1);
        table.evict_sweep(now + Duration::from_millis(20));
        assert_eq!(table.pending_flows(), 0);
    }
}
