//! Agent configuration

use crate::candidate::COMPONENT_RTP;
use crate::error::{IceError, Result};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use zeroize::Zeroizing;

/// Minimum username fragment length (RFC 8445 Section 5.3)
pub const MIN_UFRAG_LEN: usize = 4;

/// Minimum password length (RFC 8445 Section 5.3)
pub const MIN_PASSWORD_LEN: usize = 22;

/// Short-term credentials exchanged through signaling.
///
/// Passwords are zeroized on drop.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Our username fragment
    pub local_ufrag: String,
    /// Our password; peers key their checks to us with it
    pub local_password: Zeroizing<String>,
    /// The peer's username fragment
    pub remote_ufrag: String,
    /// The peer's password; keys our checks to the peer
    pub remote_password: Zeroizing<String>,
}

impl Credentials {
    /// Build credentials from the four signaled values
    #[must_use]
    pub fn new(
        local_ufrag: impl Into<String>,
        local_password: impl Into<String>,
        remote_ufrag: impl Into<String>,
        remote_password: impl Into<String>,
    ) -> Self {
        Self {
            local_ufrag: local_ufrag.into(),
            local_password: Zeroizing::new(local_password.into()),
            remote_ufrag: remote_ufrag.into(),
            remote_password: Zeroizing::new(remote_password.into()),
        }
    }

    /// USERNAME we put in outgoing checks: `remote:local`
    #[must_use]
    pub fn outbound_username(&self) -> String {
        format!("{}:{}", self.remote_ufrag, self.local_ufrag)
    }

    /// USERNAME we expect in inbound checks: `local:remote`
    #[must_use]
    pub fn inbound_username(&self) -> String {
        format!("{}:{}", self.local_ufrag, self.remote_ufrag)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("local_ufrag", &self.local_ufrag)
            .field("local_password", &"<redacted>")
            .field("remote_ufrag", &self.remote_ufrag)
            .field("remote_password", &"<redacted>")
            .finish()
    }
}

/// Connectivity check timing
#[derive(Debug, Clone)]
pub struct CheckTiming {
    /// Interval between new checks (Ta)
    pub pacing: Duration,

    /// Wait before the first retransmission; doubles on each retry
    pub initial_rto: Duration,

    /// Requests sent per pair (first transmission included) before it fails
    pub max_attempts: u32,

    /// A base read loop that sees no datagram for this long stops
    pub idle_timeout: Duration,

    /// Give up if nothing is selected by then
    pub completion_timeout: Option<Duration>,
}

impl Default for CheckTiming {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(50),
            initial_rto: Duration::from_millis(500),
            max_attempts: 7,
            idle_timeout: Duration::from_secs(60),
            completion_timeout: None,
        }
    }
}

/// Agent configuration, supplied before start
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Media stream identification tag
    pub mid: String,

    /// Component ID (only 1 is supported)
    pub component: u16,

    /// Short-term credentials
    pub credentials: Credentials,

    /// Gather IPv6 host candidates
    pub enable_ipv6: bool,

    /// Bind these addresses instead of enumerating interfaces
    pub bind_addrs: Vec<IpAddr>,

    /// STUN servers queried for server reflexive candidates
    pub stun_servers: Vec<SocketAddr>,

    /// Check timing
    pub timing: CheckTiming,

    /// Application datagrams buffered per base before new ones are dropped
    pub data_queue_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mid: "0".to_string(),
            component: COMPONENT_RTP,
            credentials: Credentials::default(),
            enable_ipv6: false,
            bind_addrs: Vec::new(),
            stun_servers: Vec::new(),
            timing: CheckTiming::default(),
            data_queue_capacity: 128,
        }
    }
}

impl AgentConfig {
    /// Configuration for stream `mid` with the given credentials
    #[must_use]
    pub fn new(mid: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            mid: mid.into(),
            credentials,
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// `Configuration` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.mid.is_empty() {
            return Err(IceError::configuration("stream identifier (mid) is empty"));
        }
        if self.component != COMPONENT_RTP {
            return Err(IceError::Configuration(Cow::Owned(format!(
                "component {} not supported, only {COMPONENT_RTP}",
                self.component
            ))));
        }

        let creds = &self.credentials;
        check_ice_token("local ufrag", &creds.local_ufrag, MIN_UFRAG_LEN)?;
        check_ice_token("remote ufrag", &creds.remote_ufrag, MIN_UFRAG_LEN)?;
        check_ice_token("local password", &creds.local_password, MIN_PASSWORD_LEN)?;
        check_ice_token("remote password", &creds.remote_password, MIN_PASSWORD_LEN)?;

        if self.timing.max_attempts == 0 {
            return Err(IceError::configuration("max_attempts must be at least 1"));
        }
        if self.timing.initial_rto.is_zero() || self.timing.pacing.is_zero() {
            return Err(IceError::configuration(
                "initial_rto and pacing must be non-zero",
            ));
        }
        if self.data_queue_capacity == 0 {
            return Err(IceError::configuration(
                "data_queue_capacity must be non-zero",
            ));
        }

        Ok(())
    }
}

/// ice-char = ALPHA / DIGIT / "+" / "/", length 1..=256
fn check_ice_token(name: &str, value: &str, min_len: usize) -> Result<()> {
    if value.len() < min_len || value.len() > 256 {
        return Err(IceError::Configuration(Cow::Owned(format!(
            "{name} must be {min_len} to 256 characters, got {}",
            value.len()
        ))));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
    {
        return Err(IceError::Configuration(Cow::Owned(format!(
            "{name} contains characters outside [A-Za-z0-9+/]"
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig::new(
            "audio",
            Credentials::new(
                "locl",
                "localpasswordlocalpassword",
                "remt",
                "remotepasswordremotepassword",
            ),
        )
    }

    #[test]
    fn test_default_timing() {
        let timing = CheckTiming::default();
        assert_eq!(timing.initial_rto, Duration::from_millis(500));
        assert_eq!(timing.idle_timeout, Duration::from_secs(60));
        assert_eq!(timing.max_attempts, 7);
        assert!(timing.completion_timeout.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.component, 1);
        assert!(!config.enable_ipv6);
        assert!(config.stun_servers.is_empty());
        assert!(config.bind_addrs.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.mid.clear();
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.component = 2;
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.credentials.local_ufrag = "abc".to_string();
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.credentials.remote_ufrag = "ab:cd".to_string();
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.credentials.local_password = Zeroizing::new("short".to_string());
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.timing.max_attempts = 0;
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));

        let mut config = valid();
        config.data_queue_capacity = 0;
        assert!(matches!(config.validate(), Err(IceError::Configuration(_))));
    }

    #[test]
    fn test_default_config_is_invalid() {
        // Credentials must come from signaling
        assert!(AgentConfig::default().validate().is_err());
    }

    #[test]
    fn test_usernames() {
        let creds = valid().credentials;
        assert_eq!(creds.outbound_username(), "remt:locl");
        assert_eq!(creds.inbound_username(), "locl:remt");
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let debug = format!("{:?}", valid().credentials);
        assert!(debug.contains("locl"));
        assert!(!debug.contains("localpassword"));
        assert!(!debug.contains("remotepassword"));
    }
}
