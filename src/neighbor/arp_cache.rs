//! IPv4 ARP cache: thin, address-typed wrapper around the generic
//! neighbor cache (§4.2).

use crate::addr::Ipv4Addr;
use crate::neighbor::cache::{CacheFlavor, NeighborCache};
use std::time::Duration;

/// ARP's `reachable_time` equivalent: how long a resolved entry is trusted
/// before moving to Stale. ARP has no keepalive probing beyond this, so a
/// generous default avoids needless re-resolution chatter (§4.2's "about
/// once per second" note applies only when an entry is actually stale).
pub const DEFAULT_REACHABLE_TIME: Duration = Duration::from_secs(300);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_PROBES: u32 = 3;

pub struct ArpCache(NeighborCache<Ipv4Addr>);

impl ArpCache {
    pub fn new() -> Self {
        ArpCache(NeighborCache::new(
            CacheFlavor::Arp,
            DEFAULT_REACHABLE_TIME,
            PROBE_INTERVAL,
            MAX_PROBES,
        ))
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for ArpCache {
    type Target = NeighborCache<Ipv4Addr>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
