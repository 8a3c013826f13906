//! Neighbor caches (§4.2): ARP cache (IPv4→MAC) and ND cache (IPv6→MAC),
//! both with pending-resolution queues and TTL expiry, plus DAD
//! bookkeeping.

pub mod arp_cache;
pub mod cache;
pub mod dad;
pub mod nd_cache;

pub use arp_cache::ArpCache;
pub use cache::{CacheAction, CacheFlavor, Lookup, NeighborCache, NeighborState, ObservationSource};
pub use dad::{DadOutcome, DadTracker};
pub use nd_cache::NdCache;
