//! ICMPv4 (RFC 792): Echo Request/Reply, Destination Unreachable
//! (including Fragmentation Needed), and an Unknown catch-all.

use crate::checksum;
use crate::error::{IntegrityError, Protocol as ErrProto};

pub const HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestUnreachableCode {
    Net,
    Host,
    Protocol,
    Port,
    FragmentationNeeded,
    Unknown(u8),
}

impl DestUnreachableCode {
    fn to_u8(self) -> u8 {
        match self {
            DestUnreachableCode::Net => 0,
            DestUnreachableCode::Host => 1,
            DestUnreachableCode::Protocol => 2,
            DestUnreachableCode::Port => 3,
            DestUnreachableCode::FragmentationNeeded => 4,
            DestUnreachableCode::Unknown(v) => v,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => DestUnreachableCode::Net,
            1 => DestUnreachableCode::Host,
            2 => DestUnreachableCode::Protocol,
            3 => DestUnreachableCode::Port,
            4 => DestUnreachableCode::FragmentationNeeded,
            other => DestUnreachableCode::Unknown(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Icmpv4Message {
    EchoRequest {
        identifier: u16,
        sequence: u16,
        data: Vec<u8>,
    },
    EchoReply {
        identifier: u16,
        sequence: u16,
        data: Vec<u8>,
    },
    DestinationUnreachable {
        code: DestUnreachableCode,
        /// Link MTU, only meaningful for `FragmentationNeeded`.
        next_hop_mtu: u16,
        /// Original IP header + first 8 bytes of the offending datagram.
        original: Vec<u8>,
    },
    Unknown {
        kind: u8,
        code: u8,
        rest_of_header: [u8; 4],
        data: Vec<u8>,
    },
}

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DEST_UNREACHABLE: u8 = 3;
const TYPE_ECHO_REQUEST: u8 = 8;

impl Icmpv4Message {
    pub fn parse(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Icmpv4, "frame shorter than ICMPv4 header"));
        }
        if checksum::checksum(bytes) != 0 {
            return Err(IntegrityError::new(ErrProto::Icmpv4, "checksum mismatch"));
        }
        let kind = bytes[0];
        let code = bytes[1];
        let rest = [bytes[4], bytes[5], bytes[6], bytes[7]];
        let body = &bytes[HEADER_LEN..];
        Ok(match kind {
            TYPE_ECHO_REQUEST => Icmpv4Message::EchoRequest {
                identifier: u16::from_be_bytes([rest[0], rest[1]]),
                sequence: u16::from_be_bytes([rest[2], rest[3]]),
                data: body.to_vec(),
            },
            TYPE_ECHO_REPLY => Icmpv4Message::EchoReply {
                identifier: u16::from_be_bytes([rest[0], rest[1]]),
                sequence: u16::from_be_bytes([rest[2], rest[3]]),
                data: body.to_vec(),
            },
            TYPE_DEST_UNREACHABLE => Icmpv4Message::DestinationUnreachable {
                code: DestUnreachableCode::from_u8(code),
                next_hop_mtu: u16::from_be_bytes([rest[2], rest[3]]),
                original: body.to_vec(),
            },
            other => Icmpv4Message::Unknown {
                kind: other,
                code,
                rest_of_header: rest,
                data: body.to_vec(),
            },
        })
    }

    pub fn assemble(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        match self {
            Icmpv4Message::EchoRequest { identifier, sequence, data } => {
                out[0] = TYPE_ECHO_REQUEST;
                out[4..6].copy_from_slice(&identifier.to_be_bytes());
                out[6..8].copy_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(data);
            }
            Icmpv4Message::EchoReply { identifier, sequence, data } => {
                out[0] = TYPE_ECHO_REPLY;
                out[4..6].copy_from_slice(&identifier.to_be_bytes());
                out[6..8].copy_from_slice(&sequence.to_be_bytes());
                out.extend_from_slice(data);
            }
            Icmpv4Message::DestinationUnreachable { code, next_hop_mtu, original } => {
                out[0] = TYPE_DEST_UNREACHABLE;
                out[1] = code.to_u8();
                out[6..8].copy_from_slice(&next_hop_mtu.to_be_bytes());
                out.extend_from_slice(original);
            }
            Icmpv4Message::Unknown { kind, code, rest_of_header, data } => {
                out[0] = *kind;
                out[1] = *code;
                out[4..8].copy_from_slice(rest_of_header);
                out.extend_from_slice(data);
            }
        }
        let csum = checksum::checksum(&out);
        out[2..4].copy_from_slice(&csum.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_reply_round_trip() {
        let msg = Icmpv4Message::EchoRequest {
            identifier: 0x1234,
            sequence: 1,
            data: b"abcd".to_vec(),
        };
        let bytes = msg.assemble();
        assert_eq!(Icmpv4Message::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn destination_unreachable_port_round_trip() {
        let msg = Icmpv4Message::DestinationUnreachable {
            code: DestUnreachableCode::Port,
            next_hop_mtu: 0,
            original: vec![0u8; 28],
        };
        let bytes = msg.assemble();
        assert_eq!(Icmpv4Message::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn checksum_bit_flip_breaks_integrity() {
        let mut bytes = Icmpv4Message::EchoRequest { identifier: 1, sequence: 1, data: vec![] }.assemble();
        bytes[2] ^= 0x01;
        assert!(Icmpv4Message::parse(&bytes).is_err());
    }
}
