//! Socket-table keys (§4.4, §9): a structured 4-tuple with a custom hash,
//! plus most-specific-first wildcard candidate generation for lookup.

use crate::addr::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `(local, remote)` address/port pair. A TCP LISTEN socket or a UDP bind
/// uses the wildcard remote produced by [`wildcard_remote`]; an established
/// TCP connection uses the peer's real address and port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketKey {
    pub local: (IpAddr, u16),
    pub remote: (IpAddr, u16),
}

pub fn wildcard_remote(family_hint: IpAddr) -> (IpAddr, u16) {
    let addr = match family_hint {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::new([0, 0, 0, 0])),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new([0; 16])),
    };
    (addr, 0)
}

impl SocketKey {
    pub fn connected(local: (IpAddr, u16), remote: (IpAddr, u16)) -> Self {
        SocketKey { local, remote }
    }

    pub fn listening(local: (IpAddr, u16)) -> Self {
        SocketKey { local, remote: wildcard_remote(local.0) }
    }

    /// Lookup order for an inbound segment (§4.4): the fully-qualified
    /// 4-tuple first, then the wildcard-remote (LISTEN) key.
    pub fn candidates(local: (IpAddr, u16), remote: (IpAddr, u16)) -> [SocketKey; 2] {
        [SocketKey::connected(local, remote), SocketKey::listening(local)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ipv4Addr;

    #[test]
    fn candidates_are_most_specific_first() {
        let local = (IpAddr::V4(Ipv4Addr::new([10, 0, 0, 1])), 80);
        let remote = (IpAddr::V4(Ipv4Addr::new([10, 0, 0, 2])), 4000);
        let candidates = SocketKey::candidates(local, remote);
        assert_eq!(candidates[0], SocketKey::connected(local, remote));
        assert_eq!(candidates[1], SocketKey::listening(local));
        assert_ne!(candidates[0], candidates[1]);
    }
}
