//! Error types for the ICE agent
//!
//! Errors fall in two groups:
//!
//! - **Fatal**: the agent cannot produce a data stream (bad configuration,
//!   interface enumeration failure, every pair failed, cancellation).
//! - **Recoverable**: one datagram, request or pair is affected and the
//!   agent carries on (parse, authentication, per-pair timeout).
//!
//! Transport errors sit in between: a failed read on one base kills that
//! base only, while a failure to enumerate interfaces aborts the agent. The
//! agent decides which by where the error is raised; the variant alone
//! reports it as fatal.
//!
//! # Example
//!
//! ```no_run
//! use icelink_agent::IceError;
//!
//! fn report(err: &IceError) {
//!     if err.is_fatal() {
//!         eprintln!("connection failed: {err}");
//!     } else {
//!         eprintln!("ignored: {err}");
//!     }
//! }
//! ```

use icelink_stun::StunError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the ICE agent
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IceError {
    // ============ Fatal Errors ============
    /// Missing or invalid credentials or stream setup
    #[error("Invalid configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// Socket bind, read or interface enumeration failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// No candidate pair was ever selected
    #[error("Checklist exhausted: no candidate pair succeeded")]
    ChecklistExhausted,

    /// Operation not valid in the agent's current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// The agent was shut down before a pair was selected
    #[error("Agent cancelled")]
    Cancelled,

    // ============ Recoverable Errors ============
    /// Malformed STUN datagram or candidate text
    #[error("Parse error: {0}")]
    Parse(Cow<'static, str>),

    /// STUN request with mismatched credentials
    #[error("Authentication failed: {0}")]
    Authentication(Cow<'static, str>),

    /// A pair exhausted its retransmission budget
    #[error("Connectivity check timed out after {attempts} attempts: {pair}")]
    CheckTimeout {
        /// Pair description (local -> remote)
        pair: String,
        /// Requests sent
        attempts: u32,
    },
}

impl IceError {
    /// Returns true if this error ends the agent
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IceError::Configuration(_)
                | IceError::Transport(_)
                | IceError::ChecklistExhausted
                | IceError::InvalidState(_)
                | IceError::Cancelled
        )
    }

    /// Returns true if the offending unit is dropped and processing continues
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Create a configuration error with static context (zero allocation)
    #[must_use]
    pub const fn configuration(context: &'static str) -> Self {
        IceError::Configuration(Cow::Borrowed(context))
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        IceError::Transport(Cow::Borrowed(context))
    }

    /// Create a parse error with static context (zero allocation)
    #[must_use]
    pub const fn parse(context: &'static str) -> Self {
        IceError::Parse(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        IceError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for IceError {
    fn from(err: std::io::Error) -> Self {
        IceError::Transport(Cow::Owned(err.to_string()))
    }
}

impl From<StunError> for IceError {
    fn from(err: StunError) -> Self {
        match err {
            StunError::AuthenticationFailed => {
                IceError::Authentication(Cow::Owned(err.to_string()))
            }
            other => IceError::Parse(Cow::Owned(other.to_string())),
        }
    }
}

/// Result type for ICE agent operations
pub type Result<T> = std::result::Result<T, IceError>;
