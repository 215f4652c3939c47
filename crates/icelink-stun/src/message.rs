//! STUN message header, encoding and decoding (RFC 5389 Section 6).

use crate::attribute::{ATTR_FINGERPRINT, ATTR_MESSAGE_INTEGRITY, StunAttribute};
use crate::error::{Result, StunError};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use std::net::SocketAddr;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Value XOR-ed into the CRC-32 of a FINGERPRINT attribute
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Size of an encoded MESSAGE-INTEGRITY attribute (4 header + 20 HMAC)
const INTEGRITY_ATTR_LEN: usize = 24;

/// Size of an encoded FINGERPRINT attribute (4 header + 4 CRC)
const FINGERPRINT_ATTR_LEN: usize = 8;

type HmacSha1 = Hmac<Sha1>;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Indication (no response expected)
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

impl StunMessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Whether this class is a response to a request
    #[must_use]
    pub fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// STUN method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunMethod {
    /// Binding request/response
    Binding,
}

impl StunMethod {
    fn code(self) -> u16 {
        match self {
            Self::Binding => 0x0001,
        }
    }
}

/// Encode method and class into the 14-bit message type.
///
/// ```text
///  0                 1
///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
/// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
/// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
fn encode_type(method: StunMethod, class: StunMessageClass) -> u16 {
    let method = method.code();
    let class_bits = class.bits();

    let m0_m3 = method & 0x0F;
    let c0 = (class_bits & 0x01) << 4;
    let m4_m6 = (method & 0x70) << 1;
    let c1 = (class_bits & 0x02) << 7;
    let m7_m11 = (method & 0xF80) << 2;

    m0_m3 | c0 | m4_m6 | c1 | m7_m11
}

fn decode_type(msg_type: u16) -> Result<(StunMethod, StunMessageClass)> {
    let c0 = (msg_type >> 4) & 0x01;
    let c1 = (msg_type >> 8) & 0x01;
    let class = StunMessageClass::from_bits(c0 | (c1 << 1));

    let m0_m3 = msg_type & 0x0F;
    let m4_m6 = (msg_type >> 1) & 0x70;
    let m7_m11 = (msg_type >> 2) & 0xF80;
    let method = m0_m3 | m4_m6 | m7_m11;

    match method {
        0x0001 => Ok((StunMethod::Binding, class)),
        other => Err(StunError::UnsupportedMethod(other)),
    }
}

/// 96-bit STUN transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate a random transaction ID
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message method
    pub method: StunMethod,
    /// Message class
    pub class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create an empty message
    #[must_use]
    pub fn new(method: StunMethod, class: StunMessageClass, transaction_id: TransactionId) -> Self {
        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding request with a fresh random transaction ID
    #[must_use]
    pub fn binding_request() -> Self {
        Self::new(
            StunMethod::Binding,
            StunMessageClass::Request,
            TransactionId::random(),
        )
    }

    /// Binding success response for `request`, reporting `mapped` as the
    /// XOR-MAPPED-ADDRESS.
    #[must_use]
    pub fn binding_success(request: &StunMessage, mapped: SocketAddr) -> Self {
        let mut msg = Self::new(
            StunMethod::Binding,
            StunMessageClass::SuccessResponse,
            request.transaction_id,
        );
        msg.add_attribute(StunAttribute::XorMappedAddress(mapped));
        msg
    }

    /// Binding error response for `request`
    #[must_use]
    pub fn binding_error(request: &StunMessage, code: u16, reason: impl Into<String>) -> Self {
        let mut msg = Self::new(
            StunMethod::Binding,
            StunMessageClass::ErrorResponse,
            request.transaction_id,
        );
        msg.add_attribute(StunAttribute::ErrorCode {
            code,
            reason: reason.into(),
        });
        msg
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes.
    ///
    /// The length field and attribute padding are always recomputed.
    ///
    /// # Errors
    ///
    /// `AttributeTooLarge` or `MessageTooLarge` when a length does not fit
    /// its 16-bit field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_attributes(&self.attributes, 0)
    }

    /// Encode the header followed by `attributes`, declaring `extra` more
    /// body bytes in the length field than are written.
    fn encode_attributes(&self, attributes: &[StunAttribute], extra: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 64);

        bytes.extend_from_slice(&encode_type(self.method, self.class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(self.transaction_id.as_bytes());

        for attr in attributes {
            attr.encode_into(&self.transaction_id, &mut bytes)?;
        }

        let body = bytes.len() - HEADER_SIZE + extra;
        let length = u16::try_from(body).map_err(|_| StunError::MessageTooLarge(body))?;
        bytes[2..4].copy_from_slice(&length.to_be_bytes());
        Ok(bytes)
    }

    /// Decode message from bytes.
    ///
    /// Unknown attribute types are skipped using their declared length.
    ///
    /// # Errors
    ///
    /// Header-level failures (see [`StunError::is_not_stun`]), an unsupported
    /// method, or a malformed known attribute.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort(bytes.len()));
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        if msg_type & 0xC000 != 0 {
            return Err(StunError::InvalidHeader);
        }

        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(cookie));
        }

        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let actual = bytes.len() - HEADER_SIZE;
        if declared != actual || declared % 4 != 0 {
            return Err(StunError::LengthMismatch { declared, actual });
        }

        let (method, class) = decode_type(msg_type)?;

        let mut id = [0u8; 12];
        id.copy_from_slice(&bytes[8..HEADER_SIZE]);
        let transaction_id = TransactionId(id);

        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(StunError::InvalidAttribute(0));
            }
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_len > bytes.len() {
                return Err(StunError::InvalidAttribute(attr_type));
            }
            let value = &bytes[offset..offset + attr_len];
            if let Some(attr) = StunAttribute::decode(attr_type, value, &transaction_id)? {
                attributes.push(attr);
            }

            offset += attr_len + (4 - (attr_len % 4)) % 4;
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }

    // ========================================================================
    // Attribute accessors
    // ========================================================================

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes
            .iter()
            .find_map(|a| match a {
                StunAttribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
            .or_else(|| {
                self.attributes.iter().find_map(|a| match a {
                    StunAttribute::MappedAddress(addr) => Some(*addr),
                    _ => None,
                })
            })
    }

    /// USERNAME attribute
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    /// PRIORITY attribute
    #[must_use]
    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    /// Whether USE-CANDIDATE is present
    #[must_use]
    pub fn use_candidate(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::UseCandidate))
    }

    /// ICE-CONTROLLED tie-breaker
    #[must_use]
    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::IceControlled(t) => Some(*t),
            _ => None,
        })
    }

    /// ICE-CONTROLLING tie-breaker
    #[must_use]
    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::IceControlling(t) => Some(*t),
            _ => None,
        })
    }

    /// ERROR-CODE as `(code, reason)`
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// Whether MESSAGE-INTEGRITY is present
    #[must_use]
    pub fn has_message_integrity(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, StunAttribute::MessageIntegrity(_)))
    }

    // ========================================================================
    // MESSAGE-INTEGRITY and FINGERPRINT
    // ========================================================================

    /// Append MESSAGE-INTEGRITY keyed with `key`.
    ///
    /// HMAC-SHA1 over the message encoded so far, with the header length
    /// already counting the MESSAGE-INTEGRITY attribute. ICE uses short-term
    /// credentials, so `key` is the password bytes. Any previous
    /// MESSAGE-INTEGRITY or FINGERPRINT is removed first.
    ///
    /// # Errors
    ///
    /// The message is too large to encode.
    pub fn add_message_integrity(&mut self, key: &[u8]) -> Result<()> {
        self.attributes.retain(|a| {
            !matches!(
                a,
                StunAttribute::MessageIntegrity(_) | StunAttribute::Fingerprint(_)
            )
        });

        let bytes = self.encode_attributes(&self.attributes, INTEGRITY_ATTR_LEN)?;
        let hmac = hmac_sha1(key, &bytes);
        self.attributes.push(StunAttribute::MessageIntegrity(hmac));
        Ok(())
    }

    /// Append FINGERPRINT. Call after [`add_message_integrity`](Self::add_message_integrity).
    ///
    /// # Errors
    ///
    /// The message is too large to encode.
    pub fn add_fingerprint(&mut self) -> Result<()> {
        self.attributes
            .retain(|a| !matches!(a, StunAttribute::Fingerprint(_)));

        let bytes = self.encode_attributes(&self.attributes, FINGERPRINT_ATTR_LEN)?;
        let fingerprint = crc32(&bytes) ^ FINGERPRINT_XOR;
        self.attributes.push(StunAttribute::Fingerprint(fingerprint));
        Ok(())
    }

    /// Verify MESSAGE-INTEGRITY over the raw received datagram.
    ///
    /// Works on the bytes as received so that padding or attributes this
    /// codec skips are covered exactly as the sender computed them.
    ///
    /// # Errors
    ///
    /// `MissingAttribute` when there is no MESSAGE-INTEGRITY,
    /// `AuthenticationFailed` when the HMAC does not match.
    pub fn verify_message_integrity(raw: &[u8], key: &[u8]) -> Result<()> {
        let offset = find_attribute(raw, ATTR_MESSAGE_INTEGRITY)?
            .ok_or(StunError::MissingAttribute("MESSAGE-INTEGRITY"))?;
        if offset + INTEGRITY_ATTR_LEN > raw.len() {
            return Err(StunError::InvalidAttribute(ATTR_MESSAGE_INTEGRITY));
        }

        let mut covered = raw[..offset].to_vec();
        let length = u16::try_from(offset - HEADER_SIZE + INTEGRITY_ATTR_LEN)
            .map_err(|_| StunError::InvalidAttribute(ATTR_MESSAGE_INTEGRITY))?;
        covered[2..4].copy_from_slice(&length.to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::AuthenticationFailed)?;
        mac.update(&covered);
        mac.verify_slice(&raw[offset + 4..offset + INTEGRITY_ATTR_LEN])
            .map_err(|_| StunError::AuthenticationFailed)
    }

    /// Verify FINGERPRINT over the raw received datagram.
    ///
    /// # Errors
    ///
    /// `MissingAttribute` when there is no FINGERPRINT,
    /// `FingerprintMismatch` when the CRC does not match.
    pub fn verify_fingerprint(raw: &[u8]) -> Result<()> {
        let offset = find_attribute(raw, ATTR_FINGERPRINT)?
            .ok_or(StunError::MissingAttribute("FINGERPRINT"))?;
        if offset + FINGERPRINT_ATTR_LEN > raw.len() {
            return Err(StunError::InvalidAttribute(ATTR_FINGERPRINT));
        }

        let value = &raw[offset + 4..offset + FINGERPRINT_ATTR_LEN];
        let received = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        if crc32(&raw[..offset]) ^ FINGERPRINT_XOR == received {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }
}

/// Byte offset of the first attribute of type `wanted` in a raw message.
fn find_attribute(raw: &[u8], wanted: u16) -> Result<Option<usize>> {
    if raw.len() < HEADER_SIZE {
        return Err(StunError::MessageTooShort(raw.len()));
    }

    let mut offset = HEADER_SIZE;
    while offset + 4 <= raw.len() {
        let attr_type = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        if attr_type == wanted {
            return Ok(Some(offset));
        }
        let attr_len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        offset += 4 + attr_len + (4 - (attr_len % 4)) % 4;
    }
    Ok(None)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// CRC-32 lookup table (IEEE polynomial 0xEDB88320, reflected).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// CRC-32 as used by FINGERPRINT (same as zlib/Ethernet)
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_message_type_encoding() {
        assert_eq!(
            encode_type(StunMethod::Binding, StunMessageClass::Request),
            0x0001
        );
        assert_eq!(
            encode_type(StunMethod::Binding, StunMessageClass::Indication),
            0x0011
        );
        assert_eq!(
            encode_type(StunMethod::Binding, StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            encode_type(StunMethod::Binding, StunMessageClass::ErrorResponse),
            0x0111
        );
    }

    #[test]
    fn test_stun_message_class_all_variants() {
        for class in [
            StunMessageClass::Request,
            StunMessageClass::Indication,
            StunMessageClass::SuccessResponse,
            StunMessageClass::ErrorResponse,
        ] {
            let msg = StunMessage::new(StunMethod::Binding, class, TransactionId::random());
            let decoded = StunMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.class, class);
            assert_eq!(decoded.method, StunMethod::Binding);
        }
    }

    #[test]
    fn test_stun_message_roundtrip() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Username("remote:local".to_string()));
        msg.add_attribute(StunAttribute::Priority(0x6e7f_00ff));
        msg.add_attribute(StunAttribute::IceControlled(0x1122_3344_5566_7788));
        msg.add_attribute(StunAttribute::UseCandidate);

        let encoded = msg.encode().unwrap();
        assert_eq!(encoded.len() % 4, 0);
        assert_eq!(StunMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_binding_success_carries_mapped_address() {
        let request = StunMessage::binding_request();
        let addr: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let response = StunMessage::binding_success(&request, addr);

        let decoded = StunMessage::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.class, StunMessageClass::SuccessResponse);
        assert_eq!(decoded.mapped_address(), Some(addr));
    }

    #[test]
    fn test_binding_error_code() {
        let request = StunMessage::binding_request();
        let response = StunMessage::binding_error(&request, 401, "Unauthorized");
        let decoded = StunMessage::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.error_code(), Some((401, "Unauthorized")));
        assert!(decoded.class.is_response());
    }

    #[test]
    fn test_magic_cookie() {
        let encoded = StunMessage::binding_request().encode().unwrap();
        assert_eq!(&encoded[4..8], &[0x21, 0x12, 0xA4, 0x42]);
    }

    #[test]
    fn test_decode_error_too_short() {
        assert_eq!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort(10))
        );
    }

    #[test]
    fn test_decode_error_invalid_magic_cookie() {
        let mut encoded = StunMessage::binding_request().encode().unwrap();
        encoded[4] = 0xFF;
        assert!(matches!(
            StunMessage::decode(&encoded),
            Err(StunError::InvalidMagicCookie(_))
        ));
    }

    #[test]
    fn test_decode_error_leading_bits() {
        let mut encoded = StunMessage::binding_request().encode().unwrap();
        encoded[0] |= 0x80;
        assert_eq!(StunMessage::decode(&encoded), Err(StunError::InvalidHeader));
    }

    #[test]
    fn test_decode_error_length_mismatch() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Priority(1));
        let mut encoded = msg.encode().unwrap();
        encoded.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            StunMessage::decode(&encoded),
            Err(StunError::LengthMismatch {
                declared: 8,
                actual: 12
            })
        );
    }

    #[test]
    fn test_decode_unsupported_method() {
        let mut encoded = StunMessage::binding_request().encode().unwrap();
        // Allocate (0x003)
        encoded[1] = 0x03;
        assert_eq!(
            StunMessage::decode(&encoded),
            Err(StunError::UnsupportedMethod(0x003))
        );
    }

    #[test]
    fn test_decode_skips_unknown_attribute() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Priority(7));
        let mut encoded = msg.encode().unwrap();
        // Comprehension-optional attribute 0x8055 with 3 bytes of value
        encoded.extend_from_slice(&[0x80, 0x55, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00]);
        let length = (encoded.len() - HEADER_SIZE) as u16;
        encoded[2..4].copy_from_slice(&length.to_be_bytes());

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.attributes, vec![StunAttribute::Priority(7)]);
    }

    #[test]
    fn test_decode_attribute_overrun() {
        let mut encoded = StunMessage::binding_request().encode().unwrap();
        encoded.extend_from_slice(&[0x00, 0x06, 0x00, 0x10]);
        encoded[2..4].copy_from_slice(&4u16.to_be_bytes());
        assert_eq!(
            StunMessage::decode(&encoded),
            Err(StunError::InvalidAttribute(0x0006))
        );
    }

    #[test]
    fn test_crc32_known_values() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_message_integrity_roundtrip() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Username("a:b".to_string()));
        msg.add_message_integrity(b"secret").unwrap();
        let encoded = msg.encode().unwrap();

        assert!(StunMessage::verify_message_integrity(&encoded, b"secret").is_ok());
        assert_eq!(
            StunMessage::verify_message_integrity(&encoded, b"wrong"),
            Err(StunError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_message_integrity_missing() {
        let encoded = StunMessage::binding_request().encode().unwrap();
        assert_eq!(
            StunMessage::verify_message_integrity(&encoded, b"secret"),
            Err(StunError::MissingAttribute("MESSAGE-INTEGRITY"))
        );
    }

    #[test]
    fn test_message_integrity_and_fingerprint() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Username("a:b".to_string()));
        msg.add_attribute(StunAttribute::Priority(1234));
        msg.add_message_integrity(b"pass").unwrap();
        msg.add_fingerprint().unwrap();
        let encoded = msg.encode().unwrap();

        // FINGERPRINT after MESSAGE-INTEGRITY must not break integrity
        assert!(StunMessage::verify_message_integrity(&encoded, b"pass").is_ok());
        assert!(StunMessage::verify_fingerprint(&encoded).is_ok());

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert!(decoded.has_message_integrity());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_fingerprint_tampered_message() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(StunAttribute::Priority(99));
        msg.add_fingerprint().unwrap();
        let mut encoded = msg.encode().unwrap();
        encoded[HEADER_SIZE + 7] ^= 0x01;
        assert_eq!(
            StunMessage::verify_fingerprint(&encoded),
            Err(StunError::FingerprintMismatch)
        );
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut msg = StunMessage::binding_request();
        for _ in 0..3 {
            msg.add_attribute(StunAttribute::Software("s".repeat(30_000)));
        }
        assert_eq!(msg.encode(), Err(StunError::MessageTooLarge(90_012)));
        assert_eq!(
            msg.add_message_integrity(b"pass"),
            Err(StunError::MessageTooLarge(90_036))
        );
        assert!(!msg.has_message_integrity());
    }

    #[test]
    fn test_transaction_id_display() {
        let id = TransactionId::from_bytes([0xab; 12]);
        assert_eq!(id.to_string(), "ab".repeat(12));
        assert_ne!(TransactionId::random(), TransactionId::random());
    }
}
