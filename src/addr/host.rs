//! Hosts: (address, network, optional gateway, origin, expiration).

use crate::addr::{Ipv4Addr, Ipv6Addr, Network4, Network6};
use std::time::Instant;
use thiserror::Error;

/// How a host address was acquired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Static,
    Dhcp,
    /// IPv6 SLAAC / Neighbor Discovery acquired address.
    Nd,
    Unknown,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInvariantError {
    #[error("host address does not lie within its network")]
    AddressNotInNetwork,
    #[error("gateway does not lie within the host's network")]
    GatewayNotInNetwork,
    #[error("IPv6 gateway must be link-local")]
    GatewayNotLinkLocal,
    #[error("IPv6 gateway must not equal the host's own or network address")]
    GatewayEqualsHostOrNetwork,
}

/// An IPv4 host address assignment.
#[derive(Clone, Copy, Debug)]
pub struct Host4 {
    pub address: Ipv4Addr,
    pub network: Network4,
    pub gateway: Option<Ipv4Addr>,
    pub origin: Origin,
    pub expiration: Option<Instant>,
}

impl Host4 {
    pub fn new(
        address: Ipv4Addr,
        network: Network4,
        gateway: Option<Ipv4Addr>,
        origin: Origin,
        expiration: Option<Instant>,
    ) -> Result<Self, HostInvariantError> {
        if !network.contains(address) {
            return Err(HostInvariantError::AddressNotInNetwork);
        }
        if let Some(gw) = gateway {
            if !network.contains(gw) {
                return Err(HostInvariantError::GatewayNotInNetwork);
            }
        }
        Ok(Host4 {
            address,
            network,
            gateway,
            origin,
            expiration,
        })
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expiration, Some(exp) if now >= exp)
    }
}

/// An IPv6 host address assignment.
#[derive(Clone, Copy, Debug)]
pub struct Host6 {
    pub address: Ipv6Addr,
    pub network: Network6,
    pub gateway: Option<Ipv6Addr>,
    pub origin: Origin,
    pub expiration: Option<Instant>,
}

impl Host6 {
    pub fn new(
        address: Ipv6Addr,
        network: Network6,
        gateway: Option<Ipv6Addr>,
        origin: Origin,
        expiration: Option<Instant>,
    ) -> Result<Self, HostInvariantError> {
        if !network.contains(address) {
            return Err(HostInvariantError::AddressNotInNetwork);
        }
        if let Some(gw) = gateway {
            if !gw.is_link_local() {
                return Err(HostInvariantError::GatewayNotLinkLocal);
            }
            if gw == address || gw == network.addr {
                return Err(HostInvariantError::GatewayEqualsHostOrNetwork);
            }
        }
        Ok(Host6 {
            address,
            network,
            gateway,
            origin,
            expiration,
        })
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expiration, Some(exp) if now >= exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Mask4;

    #[test]
    fn host_address_must_lie_within_network() {
        let net = Network4::new(Ipv4Addr::new([192, 168, 1, 0]), Mask4::from_prefix_len(24).unwrap());
        let bad = Host4::new(Ipv4Addr::new([10, 0, 0, 1]), net, None, Origin::Static, None);
        assert_eq!(bad.unwrap_err(), HostInvariantError::AddressNotInNetwork);
    }

    #[test]
    fn gateway_must_lie_within_network_v4() {
        let net = Network4::new(Ipv4Addr::new([192, 168, 1, 0]), Mask4::from_prefix_len(24).unwrap());
        let bad = Host4::new(
            Ipv4Addr::new([192, 168, 1, 5]),
            net,
            Some(Ipv4Addr::new([10, 0, 0, 1])),
            Origin::Static,
            None,
        );
        assert_eq!(bad.unwrap_err(), HostInvariantError::GatewayNotInNetwork);
    }

    #[test]
    fn gateway_must_be_link_local_v6() {
        use crate::addr::{Ipv6Addr, Mask6};
        let net = Network6::new(
            Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Mask6::from_prefix_len(64).unwrap(),
        );
        let addr = Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        let global_gw = Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
        let bad = Host6::new(addr, net, Some(global_gw), Origin::Static, None);
        assert_eq!(bad.unwrap_err(), HostInvariantError::GatewayNotLinkLocal);
    }
}
