//! Duplicate Address Detection (§4.2): on assigning a new IPv6 address
//! with origin ND, emit an NS probe with the candidate as target and
//! unspecified source. If an NA for it arrives within the DAD window, the
//! address is rejected.

use crate::addr::Ipv6Addr;
use dashmap::DashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_DAD_WINDOW: Duration = Duration::from_millis(1000);

pub enum DadOutcome {
    StillProbing,
    Accepted,
    Rejected,
}

struct Probe {
    started: Instant,
    rejected: bool,
}

pub struct DadTracker {
    window: Duration,
    probes: DashMap<Ipv6Addr, Probe>,
}

impl DadTracker {
    pub fn new(window: Duration) -> Self {
        DadTracker { window, probes: DashMap::new() }
    }

    /// Begin probing `candidate`; caller is responsible for emitting the NS.
    pub fn begin(&self, candidate: Ipv6Addr, now: Instant) {
        self.probes.insert(candidate, Probe { started: now, rejected: false });
    }

    /// Record that an NA was observed claiming `candidate` while a probe is
    /// outstanding for it.
    pub fn observe_conflict(&self, candidate: Ipv6Addr) {
        if let Some(mut probe) = self.probes.get_mut(&candidate) {
            probe.rejected = true;
        }
    }

    /// Poll the outcome for `candidate` at `now`.
    pub fn poll(&self, candidate: Ipv6Addr, now: Instant) -> DadOutcome {
        match self.probes.get(&candidate) {
            None => DadOutcome::Accepted,
            Some(probe) if probe.rejected => DadOutcome::Rejected,
            Some(probe) if now.duration_since(probe.started) >= self.window => DadOutcome::Accepted,
            Some(_) => DadOutcome::StillProbing,
        }
    }

    pub fn finish(&self, candidate: Ipv6Addr) {
        self.probes.remove(&candidate);
    }
}

impl Default for DadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DAD_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Ipv6Addr {
        Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last])
    }

    #[test]
    fn na_during_window_rejects_candidate() {
        let tracker = DadTracker::new(Duration::from_millis(100));
        let now = Instant::now();
        let candidate = addr(5);
        tracker.begin(candidate, now);
        tracker.observe_conflict(candidate);
        assert!(matches!(tracker.poll(candidate, now), DadOutcome::Rejected));
    }

    #[test]
    fn no_conflict_after_window_accepts() {
        let tracker = DadTracker::new(Duration::from_millis(10));
        let now = Instant::now();
        let candidate = addr(6);
        tracker.begin(candidate, now);
        assert!(matches!(tracker.poll(candidate, now), DadOutcome::StillProbing));
        assert!(matches!(
            tracker.poll(candidate, now + Duration::from_millis(20)),
            DadOutcome::Accepted
        ));
    }
}
