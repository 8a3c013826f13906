//! Neighbor Discovery (RFC 4861) options: SLLA, TLLA, Prefix Information,
//! MTU, and an opaque catch-all.

use crate::addr::{Ipv6Addr, MacAddr};
use crate::error::{IntegrityError, Protocol as ErrProto};
use byte_struct::{ByteStruct, ByteStructLen};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NdOption {
    SourceLinkLayerAddress(MacAddr),
    TargetLinkLayerAddress(MacAddr),
    PrefixInformation {
        prefix_len: u8,
        on_link: bool,
        autonomous: bool,
        valid_lifetime: u32,
        preferred_lifetime: u32,
        prefix: Ipv6Addr,
    },
    Mtu(u32),
    Unknown { kind: u8, data: Vec<u8> },
}

const KIND_SLLA: u8 = 1;
const KIND_TLLA: u8 = 2;
const KIND_PREFIX_INFO: u8 = 3;
const KIND_MTU: u8 = 5;

pub fn parse_options(bytes: &[u8]) -> Result<Vec<NdOption>, IntegrityError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if i + 2 > bytes.len() {
            return Err(IntegrityError::new(ErrProto::Icmpv6, "truncated ND option header"));
        }
        let kind = bytes[i];
        let len_words = bytes[i + 1] as usize;
        if len_words == 0 {
            return Err(IntegrityError::new(ErrProto::Icmpv6, "zero-length ND option"));
        }
        let len = len_words * 8;
        if i + len > bytes.len() {
            return Err(IntegrityError::new(ErrProto::Icmpv6, "ND option exceeds message"));
        }
        let body = &bytes[i + 2..i + len];
        let opt = match kind {
            KIND_SLLA if body.len() >= 6 => NdOption::SourceLinkLayerAddress(MacAddr::read_bytes(&body[0..6])),
            KIND_TLLA if body.len() >= 6 => NdOption::TargetLinkLayerAddress(MacAddr::read_bytes(&body[0..6])),
            KIND_PREFIX_INFO if body.len() >= 30 => NdOption::PrefixInformation {
                prefix_len: body[0],
                on_link: body[1] & 0x80 != 0,
                autonomous: body[1] & 0x40 != 0,
                valid_lifetime: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
                preferred_lifetime: u32::from_be_bytes([body[6], body[7], body[8], body[9]]),
                prefix: Ipv6Addr::read_bytes(&body[14..30]),
            },
            KIND_MTU if body.len() >= 6 => NdOption::Mtu(u32::from_be_bytes([body[2], body[3], body[4], body[5]])),
            other => NdOption::Unknown { kind: other, data: body.to_vec() },
        };
        out.push(opt);
        i += len;
    }
    Ok(out)
}

fn pad_to_words(mut data: Vec<u8>) -> Vec<u8> {
    while (data.len() + 2) % 8 != 0 {
        data.push(0);
    }
    data
}

pub fn assemble_options(opts: &[NdOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for opt in opts {
        let (kind, body) = match opt {
            NdOption::SourceLinkLayerAddress(mac) => (KIND_SLLA, pad_to_words(mac.octets().to_vec())),
            NdOption::TargetLinkLayerAddress(mac) => (KIND_TLLA, pad_to_words(mac.octets().to_vec())),
            NdOption::PrefixInformation {
                prefix_len,
                on_link,
                autonomous,
                valid_lifetime,
                preferred_lifetime,
                prefix,
            } => {
                let mut full = vec![0u8; 30];
                full[0] = *prefix_len;
                full[1] = (*on_link as u8) << 7 | (*autonomous as u8) << 6;
                full[2..6].copy_from_slice(&valid_lifetime.to_be_bytes());
                full[6..10].copy_from_slice(&preferred_lifetime.to_be_bytes());
                full[14..30].copy_from_slice(&prefix.octets());
                (KIND_PREFIX_INFO, full)
            }
            NdOption::Mtu(mtu) => {
                let mut body = vec![0u8; 6];
                body[2..6].copy_from_slice(&mtu.to_be_bytes());
                (KIND_MTU, body)
            }
            NdOption::Unknown { kind, data } => (*kind, pad_to_words(data.clone())),
        };
        assert!(
            !matches!(opt, NdOption::Unknown { kind, .. } if [KIND_SLLA, KIND_TLLA, KIND_PREFIX_INFO, KIND_MTU].contains(kind)),
            "known ND option kind placed in Unknown variant"
        );
        out.push(kind);
        out.push(((body.len() + 2) / 8) as u8);
        out.extend_from_slice(&body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slla_round_trips() {
        let opts = vec![NdOption::SourceLinkLayerAddress(MacAddr::new([1, 2, 3, 4, 5, 6]))];
        let bytes = assemble_options(&opts);
        assert_eq!(parse_options(&bytes).unwrap(), opts);
    }

    #[test]
    fn prefix_information_round_trips() {
        let opts = vec![NdOption::PrefixInformation {
            prefix_len: 64,
            on_link: true,
            autonomous: true,
            valid_lifetime: 2592000,
            preferred_lifetime: 604800,
            prefix: Ipv6Addr::new([0x20, 1, 0xd, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        }];
        let bytes = assemble_options(&opts);
        assert_eq!(parse_options(&bytes).unwrap(), opts);
    }

    #[test]
    fn unknown_option_round_trips_opaquely() {
        let opts = vec![NdOption::Unknown { kind: 200, data: vec![9, 9, 9, 9] }];
        let bytes = assemble_options(&opts);
        assert_eq!(parse_options(&bytes).unwrap(), opts);
    }
}
