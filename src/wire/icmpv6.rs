//! ICMPv6 (RFC 4443) plus Neighbor Discovery (RFC 4861) NS/NA/RS/RA and
//! MLDv2 Reports (RFC 3810). The §4.1 sanity table is authoritative for the
//! diverging rules the source's two ICMPv6 parsers disagreed on (§9).

use crate::addr::Ipv6Addr;
use crate::checksum;
use crate::error::{IntegrityError, Protocol as ErrProto, SanityError};
use crate::wire::nd_options::{assemble_options, parse_options, NdOption};

pub const HEADER_LEN: usize = 4;

const TYPE_DEST_UNREACHABLE: u8 = 1;
const TYPE_ECHO_REQUEST: u8 = 128;
const TYPE_ECHO_REPLY: u8 = 129;
const TYPE_MLD_REPORT: u8 = 143;
const TYPE_ROUTER_SOLICITATION: u8 = 133;
const TYPE_ROUTER_ADVERTISEMENT: u8 = 134;
const TYPE_NEIGHBOR_SOLICITATION: u8 = 135;
const TYPE_NEIGHBOR_ADVERTISEMENT: u8 = 136;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MldRecord {
    pub record_type: u8,
    pub multicast_addr: Ipv6Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Icmpv6Message {
    EchoRequest { identifier: u16, sequence: u16, data: Vec<u8> },
    EchoReply { identifier: u16, sequence: u16, data: Vec<u8> },
    DestinationUnreachable { code: u8, original: Vec<u8> },
    RouterSolicitation { options: Vec<NdOption> },
    RouterAdvertisement {
        cur_hop_limit: u8,
        managed: bool,
        other_config: bool,
        router_lifetime: u16,
        reachable_time: u32,
        retrans_timer: u32,
        options: Vec<NdOption>,
    },
    NeighborSolicitation { target: Ipv6Addr, options: Vec<NdOption> },
    NeighborAdvertisement {
        router: bool,
        solicited: bool,
        overridden: bool,
        target: Ipv6Addr,
        options: Vec<NdOption>,
    },
    MldV2Report { records: Vec<MldRecord> },
    Unknown { kind: u8, code: u8, data: Vec<u8> },
}

impl Icmpv6Message {
    pub fn parse(bytes: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> Result<Self, IntegrityError> {
        if bytes.len() < HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Icmpv6, "frame shorter than ICMPv6 header"));
        }
        let pseudo = checksum::ipv6_pseudo_header_sum(src, dst, 58, bytes.len() as u32);
        if checksum::transport_checksum(pseudo, bytes) != 0 {
            return Err(IntegrityError::new(ErrProto::Icmpv6, "checksum mismatch"));
        }
        let kind = bytes[0];
        let code = bytes[1];
        let body = &bytes[HEADER_LEN..];
        Ok(match kind {
            TYPE_ECHO_REQUEST => Icmpv6Message::EchoRequest {
                identifier: u16::from_be_bytes([body[0], body[1]]),
                sequence: u16::from_be_bytes([body[2], body[3]]),
                data: body[4..].to_vec(),
            },
            TYPE_ECHO_REPLY => Icmpv6Message::EchoReply {
                identifier: u16::from_be_bytes([body[0], body[1]]),
                sequence: u16::from_be_bytes([body[2], body[3]]),
                data: body[4..].to_vec(),
            },
            TYPE_DEST_UNREACHABLE => Icmpv6Message::DestinationUnreachable {
                code,
                original: body[4..].to_vec(),
            },
            TYPE_ROUTER_SOLICITATION => Icmpv6Message::RouterSolicitation {
                options: parse_options(&body[4..])?,
            },
            TYPE_ROUTER_ADVERTISEMENT => {
                if body.len() < 12 {
                    return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated RA"));
                }
                Icmpv6Message::RouterAdvertisement {
                    cur_hop_limit: body[0],
                    managed: body[1] & 0x80 != 0,
                    other_config: body[1] & 0x40 != 0,
                    router_lifetime: u16::from_be_bytes([body[2], body[3]]),
                    reachable_time: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                    retrans_timer: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
                    options: parse_options(&body[12..])?,
                }
            }
            TYPE_NEIGHBOR_SOLICITATION => {
                if body.len() < 20 {
                    return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated NS"));
                }
                Icmpv6Message::NeighborSolicitation {
                    target: Ipv6Addr::new(body[4..20].try_into().unwrap()),
                    options: parse_options(&body[20..])?,
                }
            }
            TYPE_NEIGHBOR_ADVERTISEMENT => {
                if body.len() < 20 {
                    return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated NA"));
                }
                Icmpv6Message::NeighborAdvertisement {
                    router: body[0] & 0x80 != 0,
                    solicited: body[0] & 0x40 != 0,
                    overridden: body[0] & 0x20 != 0,
                    target: Ipv6Addr::new(body[4..20].try_into().unwrap()),
                    options: parse_options(&body[20..])?,
                }
            }
            TYPE_MLD_REPORT => {
                if body.len() < 4 {
                    return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated MLDv2 report"));
                }
                let nr = u16::from_be_bytes([body[2], body[3]]) as usize;
                let mut records = Vec::with_capacity(nr);
                let mut i = 4;
                for _ in 0..nr {
                    if i + 20 > body.len() {
                        return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated MLDv2 record"));
                    }
                    let aux_len = body[i + 1] as usize;
                    let nsrc = u16::from_be_bytes([body[i + 2], body[i + 3]]) as usize;
                    let multicast_addr = Ipv6Addr::new(body[i + 4..i + 20].try_into().unwrap());
                    records.push(MldRecord { record_type: body[i], multicast_addr });
                    i += 20 + nsrc * 16 + aux_len * 4;
                }
                Icmpv6Message::MldV2Report { records }
            }
            other => Icmpv6Message::Unknown { kind: other, code, data: body.to_vec() },
        })
    }

    pub fn assemble(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        match self {
            Icmpv6Message::EchoRequest { identifier, sequence, data } => {
                out[0] = TYPE_ECHO_REQUEST;
                out.extend_from_slice(&identifier.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(data);
            }
            Icmpv6Message::EchoReply { identifier, sequence, data } => {
                out[0] = TYPE_ECHO_REPLY;
                out.extend_from_slice(&identifier.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(data);
            }
            Icmpv6Message::DestinationUnreachable { code, original } => {
                out[0] = TYPE_DEST_UNREACHABLE;
                out[1] = *code;
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(original);
            }
            Icmpv6Message::RouterSolicitation { options } => {
                out[0] = TYPE_ROUTER_SOLICITATION;
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&assemble_options(options));
            }
            Icmpv6Message::RouterAdvertisement {
                cur_hop_limit,
                managed,
                other_config,
                router_lifetime,
                reachable_time,
                retrans_timer,
                options,
            } => {
                out[0] = TYPE_ROUTER_ADVERTISEMENT;
                out.push(*cur_hop_limit);
                out.push((*managed as u8) << 7 | (*other_config as u8) << 6);
                out.extend_from_slice(&router_lifetime.to_be_bytes());
                out.extend_from_slice(&reachable_time.to_be_bytes());
                out.extend_from_slice(&retrans_timer.to_be_bytes());
                out.extend_from_slice(&assemble_options(options));
            }
            Icmpv6Message::NeighborSolicitation { target, options } => {
                out[0] = TYPE_NEIGHBOR_SOLICITATION;
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&target.octets());
                out.extend_from_slice(&assemble_options(options));
            }
            Icmpv6Message::NeighborAdvertisement { router, solicited, overridden, target, options } => {
                out[0] = TYPE_NEIGHBOR_ADVERTISEMENT;
                let flags = (*router as u8) << 7 | (*solicited as u8) << 6 | (*overridden as u8) << 5;
                out.extend_from_slice(&[flags, 0, 0, 0]);
                out.extend_from_slice(&target.octets());
                out.extend_from_slice(&assemble_options(options));
            }
            Icmpv6Message::MldV2Report { records } => {
                out[0] = TYPE_MLD_REPORT;
                out.extend_from_slice(&[0u8, 0]);
                out.extend_from_slice(&(records.len() as u16).to_be_bytes());
                for rec in records {
                    out.push(rec.record_type);
                    out.push(0); // aux data len
                    out.extend_from_slice(&0u16.to_be_bytes()); // number of sources
                    out.extend_from_slice(&rec.multicast_addr.octets());
                }
            }
            Icmpv6Message::Unknown { kind, code, data } => {
                out[0] = *kind;
                out[1] = *code;
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(data);
            }
        }
        let pseudo = checksum::ipv6_pseudo_header_sum(src, dst, 58, out.len() as u32);
        let csum = checksum::transport_checksum(pseudo, &out);
        out[2..4].copy_from_slice(&csum.to_be_bytes());
        out
    }

    /// §4.1 sanity table. `hop_limit` is the IPv6 header's hop limit;
    /// ND messages require it to be 255 to defeat off-link spoofing.
    pub fn check_sanity(&self, src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8) -> Result<(), SanityError> {
        let p = ErrProto::Icmpv6;
        match self {
            Icmpv6Message::RouterSolicitation { options } => {
                if hop_limit != 255 {
                    return Err(SanityError::new(p, "ND hop limit must be 255"));
                }
                if !(src.is_unicast() || src.is_unspecified()) {
                    return Err(SanityError::new(p, "RS source must be unicast or unspecified"));
                }
                if dst != Ipv6Addr::new([0xff, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]) {
                    return Err(SanityError::new(p, "RS destination must be ff02::2"));
                }
                if src.is_unspecified() && has_slla(options) {
                    return Err(SanityError::new(p, "RS with unspecified source must not carry SLLA"));
                }
                Ok(())
            }
            Icmpv6Message::RouterAdvertisement { .. } => {
                if hop_limit != 255 {
                    return Err(SanityError::new(p, "ND hop limit must be 255"));
                }
                if !src.is_link_local() {
                    return Err(SanityError::new(p, "RA source must be link-local"));
                }
                let all_nodes = Ipv6Addr::new([0xff, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
                if !(dst.is_unicast() || dst == all_nodes) {
                    return Err(SanityError::new(p, "RA destination must be unicast or ff02::1"));
                }
                Ok(())
            }
            Icmpv6Message::NeighborSolicitation { target, options } => {
                if hop_limit != 255 {
                    return Err(SanityError::new(p, "ND hop limit must be 255"));
                }
                if !(src.is_unicast() || src.is_unspecified()) {
                    return Err(SanityError::new(p, "NS source must be unicast or unspecified"));
                }
                if dst != *target && dst != target.solicited_node_multicast() {
                    return Err(SanityError::new(p, "NS destination must be target or its solicited-node multicast"));
                }
                if !target.is_unicast() {
                    return Err(SanityError::new(p, "NS target must be unicast"));
                }
                if src.is_unspecified() && has_slla(options) {
                    return Err(SanityError::new(p, "NS with unspecified source must not carry SLLA"));
                }
                Ok(())
            }
            Icmpv6Message::NeighborAdvertisement { solicited, target, .. } => {
                if hop_limit != 255 {
                    return Err(SanityError::new(p, "ND hop limit must be 255"));
                }
                if !target.is_unicast() {
                    return Err(SanityError::new(p, "NA target must be unicast"));
                }
                if !src.is_unicast() {
                    return Err(SanityError::new(p, "NA source must be unicast"));
                }
                let all_nodes = Ipv6Addr::new([0xff, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
                if *solicited {
                    if !(dst.is_unicast() || dst == all_nodes) {
                        return Err(SanityError::new(p, "solicited NA destination must be unicast or ff02::1"));
                    }
                } else if dst != all_nodes {
                    return Err(SanityError::new(p, "unsolicited NA destination must be ff02::1"));
                }
                Ok(())
            }
            Icmpv6Message::MldV2Report { .. } => {
                if hop_limit != 1 {
                    return Err(SanityError::new(p, "MLDv2 report hop limit must be 1"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn has_slla(options: &[NdOption]) -> bool {
    options.iter().any(|o| matches!(o, NdOption::SourceLinkLayerAddress(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> Ipv6Addr {
        Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last])
    }

    #[test]
    fn echo_round_trip() {
        let msg = Icmpv6Message::EchoRequest { identifier: 7, sequence: 1, data: b"hi".to_vec() };
        let bytes = msg.assemble(addr(1), addr(2));
        assert_eq!(Icmpv6Message::parse(&bytes, addr(1), addr(2)).unwrap(), msg);
    }

    #[test]
    fn ns_round_trip_and_sanity() {
        let target = addr(99);
        let msg = Icmpv6Message::NeighborSolicitation {
            target,
            options: vec![],
        };
        let src = addr(1);
        let dst = target.solicited_node_multicast();
        let bytes = msg.assemble(src, dst);
        let parsed = Icmpv6Message::parse(&bytes, src, dst).unwrap();
        assert_eq!(parsed, msg);
        assert!(parsed.check_sanity(src, dst, 255).is_ok());
        assert!(parsed.check_sanity(src, dst, 64).is_err());
    }

    #[test]
    fn mld_report_requires_hop_limit_one() {
        let msg = Icmpv6Message::MldV2Report {
            records: vec![MldRecord { record_type: 4, multicast_addr: addr(1) }],
        };
        assert!(msg.check_sanity(addr(5), addr(1), 1).is_ok());
        assert!(msg.check_sanity(addr(5), addr(1), 64).is_err());
    }
}
