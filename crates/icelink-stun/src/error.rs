//! STUN codec errors.

use thiserror::Error;

/// Errors produced while decoding or authenticating a STUN message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    /// Fewer bytes than a STUN header
    #[error("STUN message too short: {0} bytes")]
    MessageTooShort(usize),

    /// The two leading bits of the message type are not zero
    #[error("Invalid STUN header: leading bits set")]
    InvalidHeader,

    /// Magic cookie does not match 0x2112A442
    #[error("Invalid STUN magic cookie: 0x{0:08x}")]
    InvalidMagicCookie(u32),

    /// Header length field disagrees with the datagram
    #[error("STUN length mismatch: header declares {declared} bytes, body has {actual}")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Bytes actually following the header
        actual: usize,
    },

    /// Method other than Binding
    #[error("Unsupported STUN method: 0x{0:03x}")]
    UnsupportedMethod(u16),

    /// Known attribute with a malformed value, or a TLV overrunning the body
    #[error("Invalid STUN attribute 0x{0:04x}")]
    InvalidAttribute(u16),

    /// Attribute value longer than the 16-bit length field allows
    #[error("STUN attribute 0x{attr_type:04x} too large: {len} bytes")]
    AttributeTooLarge {
        /// Attribute type
        attr_type: u16,
        /// Value length
        len: usize,
    },

    /// Message body longer than the 16-bit header length allows
    #[error("STUN message too large: {0} body bytes")]
    MessageTooLarge(usize),

    /// Required attribute is absent
    #[error("Missing required STUN attribute: {0}")]
    MissingAttribute(&'static str),

    /// MESSAGE-INTEGRITY does not verify
    #[error("MESSAGE-INTEGRITY authentication failed")]
    AuthenticationFailed,

    /// FINGERPRINT does not verify
    #[error("FINGERPRINT verification failed")]
    FingerprintMismatch,
}

impl StunError {
    /// Whether the datagram is not STUN at all.
    ///
    /// A datagram that fails at the header level (too short, wrong leading
    /// bits, wrong cookie, wrong length) is application data that happens to
    /// share the socket. Anything else is a broken STUN message.
    #[must_use]
    pub fn is_not_stun(&self) -> bool {
        matches!(
            self,
            Self::MessageTooShort(_)
                | Self::InvalidHeader
                | Self::InvalidMagicCookie(_)
                | Self::LengthMismatch { .. }
        )
    }
}

/// Result type for STUN operations
pub type Result<T> = std::result::Result<T, StunError>;
