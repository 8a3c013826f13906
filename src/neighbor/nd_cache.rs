//! IPv6 Neighbor Discovery cache: thin, address-typed wrapper around the
//! generic neighbor cache (§4.2). RFC 4861 default timers.

use crate::addr::Ipv6Addr;
use crate::neighbor::cache::{CacheFlavor, NeighborCache};
use std::time::Duration;

pub const DEFAULT_REACHABLE_TIME: Duration = Duration::from_secs(30);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const MAX_PROBES: u32 = 3;

pub struct NdCache(NeighborCache<Ipv6Addr>);

impl NdCache {
    pub fn new() -> Self {
        NdCache(NeighborCache::new(
            CacheFlavor::NeighborDiscovery,
            DEFAULT_REACHABLE_TIME,
            PROBE_INTERVAL,
            MAX_PROBES,
        ))
    }
}

impl Default for NdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for NdCache {
    type Target = NeighborCache<Ipv6Addr>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
