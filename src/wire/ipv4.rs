//! IPv4 (RFC 791): header parse/assemble, options TLVs, checksum, and the
//! §4.1 sanity rules.

use crate::addr::Ipv4Addr;
use crate::checksum;
use byte_struct::ByteStruct;
use crate::error::{IntegrityError, Protocol as ErrProto, SanityError};
use modular_bitfield::prelude::*;
use static_assertions::const_assert;

pub const MIN_HEADER_LEN: usize = 20;
const_assert!(MIN_HEADER_LEN == 5 * 4);

#[bitfield]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagsAndOffset {
    pub offset: B13,
    pub mf: bool,
    pub df: bool,
    #[skip]
    reserved: B1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Ipv6Frag,
    Unknown(u8),
}

impl IpProtocol {
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Ipv6Frag => 44,
            IpProtocol::Unknown(v) => v,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            44 => IpProtocol::Ipv6Frag,
            other => IpProtocol::Unknown(other),
        }
    }
}

/// An IPv4 option. Unknown option codes round-trip opaquely; known codes
/// must never be produced inside `Unknown` (§4.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ipv4Option {
    Nop,
    Eol,
    Unknown { kind: u8, data: Vec<u8> },
}

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;

fn parse_options(bytes: &[u8]) -> Result<Vec<Ipv4Option>, IntegrityError> {
    let mut opts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            OPT_EOL => {
                opts.push(Ipv4Option::Eol);
                break;
            }
            OPT_NOP => {
                opts.push(Ipv4Option::Nop);
                i += 1;
            }
            kind => {
                if i + 1 >= bytes.len() {
                    return Err(IntegrityError::new(ErrProto::Ipv4, "truncated option length byte"));
                }
                let len = bytes[i + 1] as usize;
                if len < 2 || i + len > bytes.len() {
                    return Err(IntegrityError::new(ErrProto::Ipv4, "invalid option length"));
                }
                let data = bytes[i + 2..i + len].to_vec();
                opts.push(Ipv4Option::Unknown { kind, data });
                i += len;
            }
        }
    }
    Ok(opts)
}

fn assemble_options(opts: &[Ipv4Option]) -> Vec<u8> {
    let mut out = Vec::new();
    for opt in opts {
        match opt {
            Ipv4Option::Eol => out.push(OPT_EOL),
            Ipv4Option::Nop => out.push(OPT_NOP),
            Ipv4Option::Unknown { kind, data } => {
                assert!(*kind != OPT_EOL && *kind != OPT_NOP, "known padding code in Unknown variant");
                out.push(*kind);
                out.push((data.len() + 2) as u8);
                out.extend_from_slice(data);
            }
        }
    }
    while out.len() % 4 != 0 {
        out.push(OPT_EOL);
    }
    out
}

/// A parsed IPv4 header plus a zero-copy view of the payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_offset: FlagsAndOffset,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Vec<Ipv4Option>,
    pub payload: Vec<u8>,
}

impl Ipv4Packet {
    pub fn parse(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < MIN_HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Ipv4, "frame shorter than minimum header"));
        }
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(IntegrityError::new(ErrProto::Ipv4, "version field is not 4"));
        }
        let ihl = (bytes[0] & 0x0f) as usize;
        let header_len = ihl * 4;
        if ihl < 5 || header_len > bytes.len() {
            return Err(IntegrityError::new(ErrProto::Ipv4, "IHL out of bounds"));
        }
        let total_length = u16::from_be_bytes([bytes[2], bytes[3]]);
        if (total_length as usize) > bytes.len() || (total_length as usize) < header_len {
            return Err(IntegrityError::new(ErrProto::Ipv4, "total length inconsistent with frame"));
        }
        if checksum::checksum(&bytes[0..header_len]) != 0 {
            return Err(IntegrityError::new(ErrProto::Ipv4, "header checksum mismatch"));
        }
        let flags_offset = FlagsAndOffset::from_bytes([bytes[6], bytes[7]]);
        let options = parse_options(&bytes[MIN_HEADER_LEN..header_len])?;
        let payload = bytes[header_len..total_length as usize].to_vec();

        let packet = Ipv4Packet {
            dscp: bytes[1] >> 2,
            ecn: bytes[1] & 0x03,
            total_length,
            identification: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags_offset,
            ttl: bytes[8],
            protocol: IpProtocol::from_u8(bytes[9]),
            src: Ipv4Addr::read_bytes(&bytes[12..16]),
            dst: Ipv4Addr::read_bytes(&bytes[16..20]),
            options,
            payload,
        };
        Ok(packet)
    }

    /// §4.1 sanity table for IPv4.
    pub fn check_sanity(&self) -> Result<(), SanityError> {
        if self.ttl == 0 {
            return Err(SanityError::new(ErrProto::Ipv4, "ttl is zero"));
        }
        if self.src.is_multicast() || self.src.is_reserved() || self.src.is_limited_broadcast() {
            return Err(SanityError::new(
                ErrProto::Ipv4,
                "source is multicast, reserved, or limited broadcast",
            ));
        }
        if self.flags_offset.df() && self.flags_offset.mf() {
            return Err(SanityError::new(ErrProto::Ipv4, "DF and MF both set"));
        }
        if self.flags_offset.df() && self.flags_offset.offset() != 0 {
            return Err(SanityError::new(ErrProto::Ipv4, "DF set with nonzero fragment offset"));
        }
        Ok(())
    }

    pub fn assemble(&self) -> Vec<u8> {
        let opt_bytes = assemble_options(&self.options);
        let header_len = MIN_HEADER_LEN + opt_bytes.len();
        let total_length = (header_len + self.payload.len()) as u16;
        let mut out = vec![0u8; header_len];
        out[0] = 0x40 | ((header_len / 4) as u8 & 0x0f);
        out[1] = (self.dscp << 2) | self.ecn;
        out[2..4].copy_from_slice(&total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let fo = self.flags_offset.into_bytes();
        out[6] = fo[0];
        out[7] = fo[1];
        out[8] = self.ttl;
        out[9] = self.protocol.to_u8();
        // checksum at [10..12] left zero for the pass below
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        out[MIN_HEADER_LEN..header_len].copy_from_slice(&opt_bytes);
        let csum = checksum::checksum(&out);
        out[10..12].copy_from_slice(&csum.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Packet {
        Ipv4Packet {
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 0x1234,
            flags_offset: FlagsAndOffset::new().with_df(true).with_mf(false).with_offset(0),
            ttl: 64,
            protocol: IpProtocol::Udp,
            src: Ipv4Addr::new([192, 168, 9, 102]),
            dst: Ipv4Addr::new([192, 168, 9, 7]),
            options: vec![],
            payload: b"abcd".to_vec(),
        }
    }

    #[test]
    fn round_trip_recomputes_checksum_and_length() {
        let pkt = sample();
        let bytes = pkt.assemble();
        let parsed = Ipv4Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.src, pkt.src);
        assert_eq!(parsed.dst, pkt.dst);
        assert_eq!(parsed.payload, pkt.payload);
        assert_eq!(parsed.total_length as usize, bytes.len());
    }

    #[test]
    fn flipping_checksum_bit_breaks_integrity() {
        let mut bytes = sample().assemble();
        bytes[10] ^= 0x01;
        assert!(Ipv4Packet::parse(&bytes).is_err());
    }

    #[test]
    fn df_and_mf_both_set_fails_sanity() {
        let mut pkt = sample();
        pkt.flags_offset = FlagsAndOffset::new().with_df(true).with_mf(true);
        assert!(pkt.check_sanity().is_err());
    }

    #[test]
    fn ttl_zero_fails_sanity() {
        let mut pkt = sample();
        pkt.ttl = 0;
        assert!(pkt.check_sanity().is_err());
    }

    #[test]
    fn unknown_option_round_trips_opaquely() {
        let mut pkt = sample();
        pkt.options = vec![Ipv4Option::Nop, Ipv4Option::Unknown { kind: 0x44, data: vec![1, 2] }];
        let bytes = pkt.assemble();
        let parsed = Ipv4Packet::parse(&bytes).unwrap();
        assert!(parsed.options.contains(&Ipv4Option::Unknown { kind: 0x44, data: vec![1, 2] }));
    }
}
