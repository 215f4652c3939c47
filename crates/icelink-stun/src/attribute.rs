//! STUN attributes used by ICE connectivity checks.

use crate::error::{Result, StunError};
use crate::message::{MAGIC_COOKIE, TransactionId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// MAPPED-ADDRESS
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
/// USERNAME
pub const ATTR_USERNAME: u16 = 0x0006;
/// MESSAGE-INTEGRITY
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
/// ERROR-CODE
pub const ATTR_ERROR_CODE: u16 = 0x0009;
/// XOR-MAPPED-ADDRESS
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
/// PRIORITY (RFC 8445)
pub const ATTR_PRIORITY: u16 = 0x0024;
/// USE-CANDIDATE (RFC 8445)
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
/// SOFTWARE
pub const ATTR_SOFTWARE: u16 = 0x8022;
/// FINGERPRINT
pub const ATTR_FINGERPRINT: u16 = 0x8028;
/// ICE-CONTROLLED (RFC 8445)
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
/// ICE-CONTROLLING (RFC 8445)
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// A decoded STUN attribute.
///
/// Attribute types outside this set are skipped on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Mapped address (0x0001), plain encoding
    MappedAddress(SocketAddr),
    /// Username (0x0006)
    Username(String),
    /// HMAC-SHA1 message integrity (0x0008)
    MessageIntegrity([u8; 20]),
    /// Error code (0x0009)
    ErrorCode {
        /// Code in 300..=699
        code: u16,
        /// UTF-8 reason phrase
        reason: String,
    },
    /// XOR-mapped address (0x0020)
    XorMappedAddress(SocketAddr),
    /// Priority a peer-reflexive candidate would get (0x0024)
    Priority(u32),
    /// Nomination marker (0x0025)
    UseCandidate,
    /// Software identifier (0x8022)
    Software(String),
    /// CRC-32 fingerprint (0x8028)
    Fingerprint(u32),
    /// Sender is in the controlled role, with its tie-breaker (0x8029)
    IceControlled(u64),
    /// Sender is in the controlling role, with its tie-breaker (0x802A)
    IceControlling(u64),
}

impl StunAttribute {
    /// Attribute type code
    #[must_use]
    pub fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::Username(_) => ATTR_USERNAME,
            Self::MessageIntegrity(_) => ATTR_MESSAGE_INTEGRITY,
            Self::ErrorCode { .. } => ATTR_ERROR_CODE,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Priority(_) => ATTR_PRIORITY,
            Self::UseCandidate => ATTR_USE_CANDIDATE,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Fingerprint(_) => ATTR_FINGERPRINT,
            Self::IceControlled(_) => ATTR_ICE_CONTROLLED,
            Self::IceControlling(_) => ATTR_ICE_CONTROLLING,
        }
    }

    /// Append the TLV encoding (type, length, value, zero padding) to `out`.
    ///
    /// # Errors
    ///
    /// `AttributeTooLarge` if the value does not fit the 16-bit length.
    pub(crate) fn encode_into(&self, transaction_id: &TransactionId, out: &mut Vec<u8>) -> Result<()> {
        let value = self.encode_value(transaction_id);
        let len = u16::try_from(value.len()).map_err(|_| StunError::AttributeTooLarge {
            attr_type: self.attr_type(),
            len: value.len(),
        })?;

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        out.extend(std::iter::repeat_n(0, padding));
        Ok(())
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(transaction_id)),
            Self::Username(s) | Self::Software(s) => s.as_bytes().to_vec(),
            Self::MessageIntegrity(hmac) => hmac.to_vec(),
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Priority(p) => p.to_be_bytes().to_vec(),
            Self::UseCandidate => Vec::new(),
            Self::Fingerprint(f) => f.to_be_bytes().to_vec(),
            Self::IceControlled(t) | Self::IceControlling(t) => t.to_be_bytes().to_vec(),
        }
    }

    /// Decode one attribute value.
    ///
    /// Returns `Ok(None)` for attribute types this codec does not know.
    pub(crate) fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Option<Self>> {
        let invalid = || StunError::InvalidAttribute(attr_type);

        let attr = match attr_type {
            ATTR_MAPPED_ADDRESS => Self::MappedAddress(decode_address(attr_type, value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => {
                Self::XorMappedAddress(decode_address(attr_type, value, Some(transaction_id))?)
            }
            ATTR_USERNAME => Self::Username(utf8(attr_type, value)?),
            ATTR_SOFTWARE => Self::Software(utf8(attr_type, value)?),
            ATTR_MESSAGE_INTEGRITY => {
                Self::MessageIntegrity(value.try_into().map_err(|_| invalid())?)
            }
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(invalid());
                }
                let class = u16::from(value[2] & 0x07);
                let number = u16::from(value[3]);
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(invalid());
                }
                Self::ErrorCode {
                    code: class * 100 + number,
                    reason: utf8(attr_type, &value[4..])?,
                }
            }
            ATTR_PRIORITY => {
                Self::Priority(u32::from_be_bytes(value.try_into().map_err(|_| invalid())?))
            }
            ATTR_USE_CANDIDATE => {
                if !value.is_empty() {
                    return Err(invalid());
                }
                Self::UseCandidate
            }
            ATTR_FINGERPRINT => {
                Self::Fingerprint(u32::from_be_bytes(value.try_into().map_err(|_| invalid())?))
            }
            ATTR_ICE_CONTROLLED => {
                Self::IceControlled(u64::from_be_bytes(value.try_into().map_err(|_| invalid())?))
            }
            ATTR_ICE_CONTROLLING => {
                Self::IceControlling(u64::from_be_bytes(value.try_into().map_err(|_| invalid())?))
            }
            _ => return Ok(None),
        };

        Ok(Some(attr))
    }
}

fn utf8(attr_type: u16, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec()).map_err(|_| StunError::InvalidAttribute(attr_type))
}

/// XOR key for addresses: magic cookie followed by the transaction ID.
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id.as_bytes());
    key
}

fn encode_address(addr: SocketAddr, xor: Option<&TransactionId>) -> Vec<u8> {
    let key = xor.map(xor_key);
    let mut port = addr.port();
    if key.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let mut value = Vec::with_capacity(20);
    value.push(0); // Reserved
    match addr.ip() {
        IpAddr::V4(_) => value.push(FAMILY_IPV4),
        IpAddr::V6(_) => value.push(FAMILY_IPV6),
    }
    value.extend_from_slice(&port.to_be_bytes());

    let octets: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    match key {
        Some(key) => value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k)),
        None => value.extend_from_slice(&octets),
    }

    value
}

fn decode_address(
    attr_type: u16,
    value: &[u8],
    xor: Option<&TransactionId>,
) -> Result<SocketAddr> {
    let invalid = || StunError::InvalidAttribute(attr_type);

    if value.len() < 4 {
        return Err(invalid());
    }
    let key = xor.map(xor_key);
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if key.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let unmask = |i: usize, b: u8| key.map_or(b, |k| b ^ k[i]);
    let ip = match value[1] {
        FAMILY_IPV4 if value.len() == 8 => {
            let mut octets = [0u8; 4];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = unmask(i, value[4 + i]);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 if value.len() == 20 => {
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = unmask(i, value[4 + i]);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(invalid()),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid() -> TransactionId {
        TransactionId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])
    }

    fn encode(attr: &StunAttribute) -> Vec<u8> {
        let mut out = Vec::new();
        attr.encode_into(&txid(), &mut out).unwrap();
        out
    }

    #[test]
    fn test_username_attribute_encoding() {
        let encoded = encode(&StunAttribute::Username("abc".to_string()));
        assert_eq!(&encoded[0..2], &ATTR_USERNAME.to_be_bytes());
        assert_eq!(&encoded[2..4], &3u16.to_be_bytes());
        assert_eq!(&encoded[4..7], b"abc");
        assert_eq!(encoded.len(), 8);
        assert_eq!(encoded[7], 0);
    }

    #[test]
    fn test_xor_mapped_address_ipv4_wire_bytes() {
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let encoded = encode(&StunAttribute::XorMappedAddress(addr));
        // RFC 5769 style: port 32853 ^ 0x2112 = 0xa147
        assert_eq!(&encoded[4..8], &[0x00, 0x01, 0xa1, 0x47]);
        assert_eq!(&encoded[8..12], &[0xe1, 0x12, 0xa6, 0x43]);
    }

    #[test]
    fn test_xor_mapped_address_ipv6_roundtrip() {
        let addr: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let encoded = encode(&StunAttribute::XorMappedAddress(addr));
        let decoded = StunAttribute::decode(ATTR_XOR_MAPPED_ADDRESS, &encoded[4..], &txid())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, StunAttribute::XorMappedAddress(addr));
    }

    #[test]
    fn test_mapped_address_is_plain() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let encoded = encode(&StunAttribute::MappedAddress(addr));
        assert_eq!(&encoded[8..12], &[10, 0, 0, 1]);
        assert_eq!(&encoded[6..8], &5000u16.to_be_bytes());
    }

    #[test]
    fn test_error_code_encoding() {
        let attr = StunAttribute::ErrorCode {
            code: 487,
            reason: "Role Conflict".to_string(),
        };
        let encoded = encode(&attr);
        assert_eq!(encoded[6], 4);
        assert_eq!(encoded[7], 87);
        let len = u16::from_be_bytes([encoded[2], encoded[3]]) as usize;
        let decoded = StunAttribute::decode(ATTR_ERROR_CODE, &encoded[4..4 + len], &txid())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, attr);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let attr = StunAttribute::Software("x".repeat(70_000));
        let mut out = Vec::new();
        assert_eq!(
            attr.encode_into(&txid(), &mut out),
            Err(StunError::AttributeTooLarge {
                attr_type: ATTR_SOFTWARE,
                len: 70_000
            })
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_use_candidate_is_empty() {
        let encoded = encode(&StunAttribute::UseCandidate);
        assert_eq!(encoded, vec![0x00, 0x25, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_attribute_skipped() {
        let decoded = StunAttribute::decode(0x7fff, &[1, 2, 3], &txid()).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_malformed_known_attribute() {
        assert_eq!(
            StunAttribute::decode(ATTR_PRIORITY, &[1, 2], &txid()),
            Err(StunError::InvalidAttribute(ATTR_PRIORITY))
        );
        assert_eq!(
            StunAttribute::decode(ATTR_XOR_MAPPED_ADDRESS, &[0, 1, 0, 0, 1], &txid()),
            Err(StunError::InvalidAttribute(ATTR_XOR_MAPPED_ADDRESS))
        );
        assert_eq!(
            StunAttribute::decode(ATTR_MESSAGE_INTEGRITY, &[0; 19], &txid()),
            Err(StunError::InvalidAttribute(ATTR_MESSAGE_INTEGRITY))
        );
    }
}
