//! IPv6 (RFC 8200) base header and Fragment extension header.

use crate::addr::Ipv6Addr;
use crate::error::{IntegrityError, Protocol as ErrProto};
use byte_struct::ByteStruct;
use crate::wire::ipv4::IpProtocol;

pub const BASE_HEADER_LEN: usize = 40;
pub const FRAGMENT_HEADER_LEN: usize = 8;

pub const NEXT_HEADER_FRAGMENT: u8 = 44;

/// A parsed IPv6 base header plus payload. The Fragment extension header,
/// if present, has already been peeled off into `fragment`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub next_header: IpProtocol,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub fragment: Option<FragmentHeader>,
    pub payload: Vec<u8>,
}

/// RFC 8200 §4.5 Fragment extension header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub next_header: IpProtocol,
    pub offset: u16,
    pub more_fragments: bool,
    pub identification: u32,
}

impl FragmentHeader {
    fn parse(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Ipv6, "truncated fragment header"));
        }
        let offset_and_flags = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(FragmentHeader {
            next_header: IpProtocol::from_u8(bytes[0]),
            offset: offset_and_flags >> 3,
            more_fragments: offset_and_flags & 0x1 != 0,
            identification: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    fn assemble(&self, next_header_for_base: u8) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut out = [0u8; FRAGMENT_HEADER_LEN];
        out[0] = next_header_for_base;
        let offset_and_flags = (self.offset << 3) | (self.more_fragments as u16);
        out[2..4].copy_from_slice(&offset_and_flags.to_be_bytes());
        out[4..8].copy_from_slice(&self.identification.to_be_bytes());
        out
    }
}

impl Ipv6Packet {
    pub fn parse(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < BASE_HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Ipv6, "frame shorter than base header"));
        }
        let version = bytes[0] >> 4;
        if version != 6 {
            return Err(IntegrityError::new(ErrProto::Ipv6, "version field is not 6"));
        }
        let traffic_class = ((bytes[0] & 0x0f) << 4) | (bytes[1] >> 4);
        let flow_label = (((bytes[1] & 0x0f) as u32) << 16)
            | ((bytes[2] as u32) << 8)
            | (bytes[3] as u32);
        let payload_length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        let mut next_header = bytes[6];
        let hop_limit = bytes[7];
        let src = Ipv6Addr::read_bytes(&bytes[8..24]);
        let dst = Ipv6Addr::read_bytes(&bytes[24..40]);
        if BASE_HEADER_LEN + payload_length > bytes.len() {
            return Err(IntegrityError::new(ErrProto::Ipv6, "payload length exceeds frame"));
        }
        let mut cursor = BASE_HEADER_LEN;
        let end = BASE_HEADER_LEN + payload_length;
        let mut fragment = None;
        if next_header == NEXT_HEADER_FRAGMENT {
            let fh = FragmentHeader::parse(&bytes[cursor..end])?;
            next_header = fh.next_header.to_u8();
            fragment = Some(fh);
            cursor += FRAGMENT_HEADER_LEN;
        }
        Ok(Ipv6Packet {
            traffic_class,
            flow_label,
            hop_limit,
            next_header: IpProtocol::from_u8(next_header),
            src,
            dst,
            fragment,
            payload: bytes[cursor..end].to_vec(),
        })
    }

    pub fn assemble(&self) -> Vec<u8> {
        let ext_len = if self.fragment.is_some() { FRAGMENT_HEADER_LEN } else { 0 };
        let payload_length = ext_len + self.payload.len();
        let mut out = vec![0u8; BASE_HEADER_LEN];
        out[0] = 0x60 | (self.traffic_class >> 4);
        out[1] = (self.traffic_class << 4) | ((self.flow_label >> 16) as u8 & 0x0f);
        out[2] = (self.flow_label >> 8) as u8;
        out[3] = self.flow_label as u8;
        out[4..6].copy_from_slice(&(payload_length as u16).to_be_bytes());
        out[6] = if self.fragment.is_some() {
            NEXT_HEADER_FRAGMENT
        } else {
            self.next_header.to_u8()
        };
        out[7] = self.hop_limit;
        out[8..24].copy_from_slice(&self.src.octets());
        out[24..40].copy_from_slice(&self.dst.octets());
        if let Some(fh) = &self.fragment {
            out.extend_from_slice(&fh.assemble(self.next_header.to_u8()));
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ipv6Addr;

    fn addr(last: u8) -> Ipv6Addr {
        Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last])
    }

    #[test]
    fn round_trip_without_fragment() {
        let pkt = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0x12345,
            hop_limit: 64,
            next_header: IpProtocol::Udp,
            src: addr(1),
            dst: addr(2),
            fragment: None,
            payload: b"hello".to_vec(),
        };
        let bytes = pkt.assemble();
        assert_eq!(Ipv6Packet::parse(&bytes).unwrap(), pkt);
    }

    #[test]
    fn round_trip_with_fragment_header() {
        let pkt = Ipv6Packet {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: 64,
            next_header: IpProtocol::Udp,
            src: addr(1),
            dst: addr(2),
            fragment: Some(FragmentHeader {
                next_header: IpProtocol::Udp,
                offset: 0,
                more_fragments: true,
                identification: 0xdead_beef,
            }),
            payload: b"partial".to_vec(),
        };
        let bytes = pkt.assemble();
        let parsed = Ipv6Packet::parse(&bytes).unwrap();
        assert_eq!(parsed, pkt);
        assert_eq!(parsed.next_header, IpProtocol::Udp);
    }
}
