//! # icelink STUN
//!
//! STUN (RFC 5389) message codec used by the icelink ICE agent.
//!
//! This crate provides:
//! - Header encoding with the interleaved method/class bits
//! - The attribute set ICE connectivity checks need (USERNAME, PRIORITY,
//!   USE-CANDIDATE, ICE-CONTROLLED/ICE-CONTROLLING, XOR-MAPPED-ADDRESS,
//!   ERROR-CODE)
//! - MESSAGE-INTEGRITY (HMAC-SHA1, short-term credentials) and FINGERPRINT
//!
//! It performs no I/O.
//!
//! ## Example
//!
//! ```rust
//! use icelink_stun::{StunAttribute, StunMessage};
//!
//! let mut request = StunMessage::binding_request();
//! request.add_attribute(StunAttribute::Username("remote:local".to_string()));
//! request.add_attribute(StunAttribute::Priority(1_862_270_975));
//! request.add_message_integrity(b"remote-password").unwrap();
//! request.add_fingerprint().unwrap();
//!
//! let bytes = request.encode().unwrap();
//! let decoded = StunMessage::decode(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! assert!(StunMessage::verify_message_integrity(&bytes, b"remote-password").is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod error;
pub mod message;

pub use attribute::StunAttribute;
pub use error::{Result, StunError};
pub use message::{
    HEADER_SIZE, MAGIC_COOKIE, StunMessage, StunMessageClass, StunMethod, TransactionId,
};
