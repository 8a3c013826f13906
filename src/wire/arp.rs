//! Address Resolution Protocol (RFC 826), IPv4-over-Ethernet only.

use crate::addr::{Ipv4Addr, MacAddr};
use crate::error::{IntegrityError, Protocol as ErrProto};
use byte_struct::*;
use static_assertions::const_assert;

pub const LEN: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    Unknown(u16),
}

impl ArpOperation {
    fn to_u16(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
            ArpOperation::Unknown(v) => v,
        }
    }

    fn from_u16(v: u16) -> Self {
        match v {
            1 => ArpOperation::Request,
            2 => ArpOperation::Reply,
            other => ArpOperation::Unknown(other),
        }
    }
}

impl ByteStructLen for ArpOperation {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ArpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        ArpOperation::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..2].copy_from_slice(&self.to_u16().to_be_bytes());
    }
}

/// Wire layout of an IPv4-over-Ethernet ARP message: htype=1, ptype=0x0800,
/// hlen=6, plen=4 are fixed and carried as plain fields rather than
/// validated out-of-band.
#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
struct ArpHeader {
    htype: u16,
    ptype: u16,
    hlen: u8,
    plen: u8,
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
}

const_assert!(ArpHeader::BYTE_LEN == 28);

/// An ARP request or response for IPv4-over-Ethernet (htype=1, ptype=0x0800,
/// hlen=6, plen=4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpMessage {
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpMessage {
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        ArpMessage {
            operation: ArpOperation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_mac: MacAddr, target_ip: Ipv4Addr) -> Self {
        ArpMessage {
            operation: ArpOperation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < LEN {
            return Err(IntegrityError::new(ErrProto::Arp, "frame shorter than ARP payload"));
        }
        let header = ArpHeader::read_bytes(&bytes[0..LEN]);
        if header.htype != 1 || header.ptype != 0x0800 || header.hlen != 6 || header.plen != 4 {
            return Err(IntegrityError::new(
                ErrProto::Arp,
                "unsupported hardware/protocol address type or length",
            ));
        }
        Ok(ArpMessage {
            operation: header.operation,
            sender_mac: header.sender_mac,
            sender_ip: header.sender_ip,
            target_mac: header.target_mac,
            target_ip: header.target_ip,
        })
    }

    pub fn assemble(&self) -> [u8; LEN] {
        let header = ArpHeader {
            htype: 1,
            ptype: 0x0800,
            hlen: 6,
            plen: 4,
            operation: self.operation,
            sender_mac: self.sender_mac,
            sender_ip: self.sender_ip,
            target_mac: self.target_mac,
            target_ip: self.target_ip,
        };
        let mut out = [0u8; LEN];
        header.write_bytes(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_request() {
        let msg = ArpMessage::request(
            MacAddr::new([2, 1, 2, 3, 4, 5]),
            Ipv4Addr::new([192, 168, 1, 1]),
            Ipv4Addr::new([192, 168, 1, 2]),
        );
        let bytes = msg.assemble();
        assert_eq!(ArpMessage::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_unsupported_hardware_type() {
        let mut bytes = ArpMessage::request(
            MacAddr::ZERO,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        )
        .assemble();
        bytes[1] = 6; // htype = 6 (token ring), not 1
        assert!(ArpMessage::parse(&bytes).is_err());
    }
}
