//! TCP (RFC 9293) segment header, options, and checksum.

use crate::checksum;
use crate::error::{IntegrityError, Protocol as ErrProto};
use modular_bitfield::prelude::*;

pub const MIN_HEADER_LEN: usize = 20;
pub const MAX_WSCALE: u8 = 14;

#[bitfield]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(v: u8) -> Self {
        TcpFlags::from_bytes([v])
    }

    pub fn to_u8(self) -> u8 {
        self.into_bytes()[0]
    }
}

/// A TCP option. Unknown kinds round-trip opaquely; known kinds must never
/// appear in `Unknown` (§4.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TcpOption {
    Nop,
    Eol,
    Mss(u16),
    /// Window scale shift count, clamped to [`MAX_WSCALE`] on parse per §6.
    WindowScale(u8),
    SackPermitted,
    Timestamps { value: u32, echo_reply: u32 },
    Unknown { kind: u8, data: Vec<u8> },
}

const OPT_EOL: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_TIMESTAMPS: u8 = 8;

fn parse_options(bytes: &[u8]) -> Result<Vec<TcpOption>, IntegrityError> {
    let mut opts = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            OPT_EOL => {
                opts.push(TcpOption::Eol);
                break;
            }
            OPT_NOP => {
                opts.push(TcpOption::Nop);
                i += 1;
            }
            kind => {
                if i + 1 >= bytes.len() {
                    return Err(IntegrityError::new(ErrProto::Tcp, "truncated option length byte"));
                }
                let len = bytes[i + 1] as usize;
                if len < 2 || i + len > bytes.len() {
                    return Err(IntegrityError::new(ErrProto::Tcp, "invalid option length"));
                }
                let data = &bytes[i + 2..i + len];
                let opt = match kind {
                    OPT_MSS if data.len() == 2 => TcpOption::Mss(u16::from_be_bytes([data[0], data[1]])),
                    OPT_WSCALE if data.len() == 1 => TcpOption::WindowScale(data[0].min(MAX_WSCALE)),
                    OPT_SACK_PERMITTED if data.is_empty() => TcpOption::SackPermitted,
                    OPT_TIMESTAMPS if data.len() == 8 => TcpOption::Timestamps {
                        value: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                        echo_reply: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                    },
                    other => TcpOption::Unknown { kind: other, data: data.to_vec() },
                };
                opts.push(opt);
                i += len;
            }
        }
    }
    Ok(opts)
}

fn assemble_options(opts: &[TcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for opt in opts {
        match opt {
            TcpOption::Eol => out.push(OPT_EOL),
            TcpOption::Nop => out.push(OPT_NOP),
            TcpOption::Mss(mss) => {
                out.push(OPT_MSS);
                out.push(4);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => {
                out.push(OPT_WSCALE);
                out.push(3);
                out.push((*shift).min(MAX_WSCALE));
            }
            TcpOption::SackPermitted => {
                out.push(OPT_SACK_PERMITTED);
                out.push(2);
            }
            TcpOption::Timestamps { value, echo_reply } => {
                out.push(OPT_TIMESTAMPS);
                out.push(10);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo_reply.to_be_bytes());
            }
            TcpOption::Unknown { kind, data } => {
                assert!(
                    ![OPT_EOL, OPT_NOP, OPT_MSS, OPT_WSCALE, OPT_SACK_PERMITTED, OPT_TIMESTAMPS].contains(kind),
                    "known TCP option kind placed in Unknown variant"
                );
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

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn parse(bytes: &[u8], pseudo_sum: u32) -> Result<Self, IntegrityError> {
        if bytes.len() < MIN_HEADER_LEN {
            return Err(IntegrityError::new(ErrProto::Tcp, "frame shorter than minimum TCP header"));
        }
        let data_offset = (bytes[12] >> 4) as usize;
        let header_len = data_offset * 4;
        if data_offset < 5 || header_len > bytes.len() {
            return Err(IntegrityError::new(ErrProto::Tcp, "data offset out of bounds"));
        }
        if checksum::transport_checksum(pseudo_sum, bytes) != 0 {
            return Err(IntegrityError::new(ErrProto::Tcp, "checksum mismatch"));
        }
        let options = parse_options(&bytes[MIN_HEADER_LEN..header_len])?;
        Ok(TcpSegment {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: TcpFlags::from_u8(bytes[13]),
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            urgent_pointer: u16::from_be_bytes([bytes[18], bytes[19]]),
            options,
            payload: bytes[header_len..].to_vec(),
        })
    }

    /// Wire length this segment will occupy once assembled, for computing
    /// the pseudo-header length field ahead of time.
    pub fn wire_len(&self) -> usize {
        MIN_HEADER_LEN + assemble_options(&self.options).len() + self.payload.len()
    }

    pub fn assemble(&self, pseudo_sum: u32) -> Vec<u8> {
        let opt_bytes = assemble_options(&self.options);
        let header_len = MIN_HEADER_LEN + opt_bytes.len();
        let mut out = vec![0u8; header_len + self.payload.len()];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = self.flags.to_u8();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[MIN_HEADER_LEN..header_len].copy_from_slice(&opt_bytes);
        out[header_len..].copy_from_slice(&self.payload);
        let csum = checksum::transport_checksum(pseudo_sum, &out);
        out[16..18].copy_from_slice(&csum.to_be_bytes());
        out
    }

    pub fn mss(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Mss(v) => Some(*v),
            _ => None,
        })
    }

    pub fn window_scale(&self) -> Option<u8> {
        self.options.iter().find_map(|o| match o {
            TcpOption::WindowScale(v) => Some(*v),
            _ => None,
        })
    }

    pub fn sack_permitted(&self) -> bool {
        self.options.iter().any(|o| matches!(o, TcpOption::SackPermitted))
    }

    pub fn timestamps(&self) -> Option<(u32, u32)> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Timestamps { value, echo_reply } => Some((*value, *echo_reply)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ipv4Addr;

    fn pseudo(len: u16) -> u32 {
        checksum::ipv4_pseudo_header_sum(Ipv4Addr::new([10, 0, 0, 1]), Ipv4Addr::new([10, 0, 0, 2]), 6, len)
    }

    #[test]
    fn round_trip_with_options() {
        let seg = TcpSegment {
            src_port: 1234,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: TcpFlags::new().with_syn(true),
            window: 65535,
            urgent_pointer: 0,
            options: vec![
                TcpOption::Mss(1460),
                TcpOption::WindowScale(7),
                TcpOption::SackPermitted,
                TcpOption::Nop,
            ],
            payload: vec![],
        };
        let bytes = seg.assemble(pseudo(0));
        let parsed = TcpSegment::parse(&bytes, pseudo(0)).unwrap();
        assert_eq!(parsed.src_port, seg.src_port);
        assert_eq!(parsed.flags, seg.flags);
        assert_eq!(parsed.mss(), Some(1460));
        assert_eq!(parsed.window_scale(), Some(7));
        assert!(parsed.sack_permitted());
    }

    #[test]
    fn wscale_above_14_is_clamped_on_parse() {
        let mut seg = TcpSegment {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            flags: TcpFlags::new(),
            window: 0,
            urgent_pointer: 0,
            options: vec![TcpOption::WindowScale(20)],
            payload: vec![],
        };
        let bytes = seg.assemble(pseudo(0));
        let parsed = TcpSegment::parse(&bytes, pseudo(0)).unwrap();
        assert_eq!(parsed.window_scale(), Some(MAX_WSCALE));
        seg.options = vec![TcpOption::WindowScale(MAX_WSCALE)];
    }

    #[test]
    fn unknown_option_round_trips_opaquely() {
        let seg = TcpSegment {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            flags: TcpFlags::new(),
            window: 0,
            urgent_pointer: 0,
            options: vec![TcpOption::Unknown { kind: 99, data: vec![1, 2, 3] }],
            payload: vec![],
        };
        let bytes = seg.assemble(pseudo(0));
        let parsed = TcpSegment::parse(&bytes, pseudo(0)).unwrap();
        assert!(parsed.options.contains(&TcpOption::Unknown { kind: 99, data: vec![1, 2, 3] }));
    }

    #[test]
    fn checksum_bit_flip_breaks_integrity() {
        let seg = TcpSegment {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            flags: TcpFlags::new(),
            window: 0,
            urgent_pointer: 0,
            options: vec![],
            payload: vec![],
        };
        let mut bytes = seg.assemble(pseudo(0));
        bytes[16] ^= 0x01;
        assert!(TcpSegment::parse(&bytes, pseudo(0)).is_err());
    }
}
