//! Configuration system for the icelink CLI.

use anyhow::Context;
use icelink_agent::{AgentConfig, CheckTiming, Credentials};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Generated username fragment length
const UFRAG_LEN: usize = 8;

/// Generated password length
const PASSWORD_LEN: usize = 24;

/// icelink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent configuration
    #[serde(default)]
    pub agent: AgentSection,
    /// Check timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Media stream identification tag
    #[serde(default = "default_mid")]
    pub mid: String,
    /// Local username fragment (generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ufrag: Option<String>,
    /// Local password (generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    /// Peer's username fragment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ufrag: Option<String>,
    /// Peer's password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_pwd: Option<String>,
    /// Gather IPv6 host candidates
    #[serde(default)]
    pub enable_ipv6: bool,
    /// STUN servers (host:port)
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Addresses to bind instead of enumerating interfaces
    #[serde(default)]
    pub bind_addrs: Vec<String>,
    /// Application datagrams buffered per base
    #[serde(default = "default_data_queue_capacity")]
    pub data_queue_capacity: usize,
}

/// Check timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between new checks in milliseconds
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    /// First retransmission timeout in milliseconds
    #[serde(default = "default_initial_rto_ms")]
    pub initial_rto_ms: u64,
    /// Requests per pair before it fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base idle timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Give up after this many seconds without a selected pair
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_timeout_secs: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_mid() -> String {
    "0".to_string()
}

fn default_data_queue_capacity() -> usize {
    128
}

fn default_pacing_ms() -> u64 {
    50
}

fn default_initial_rto_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    7
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mid: default_mid(),
            ufrag: None,
            pwd: None,
            remote_ufrag: None,
            remote_pwd: None,
            enable_ipv6: false,
            stun_servers: Vec::new(),
            bind_addrs: Vec::new(),
            data_queue_capacity: default_data_queue_capacity(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            initial_rto_ms: default_initial_rto_ms(),
            max_attempts: default_max_attempts(),
            idle_timeout_secs: default_idle_timeout_secs(),
            completion_timeout_secs: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("icelink/config.toml")
    }

    /// Load config from the default path, or the built-in defaults if there
    /// is no file
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Fill in a random local username fragment and password where none is
    /// configured
    pub fn generate_missing_credentials(&mut self) {
        if self.agent.ufrag.is_none() {
            self.agent.ufrag = Some(random_ice_string(UFRAG_LEN));
        }
        if self.agent.pwd.is_none() {
            self.agent.pwd = Some(random_ice_string(PASSWORD_LEN));
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for server in &self.agent.stun_servers {
            validate_host_port(server, "STUN server")?;
        }

        for addr in &self.agent.bind_addrs {
            addr.parse::<IpAddr>()
                .map_err(|_| anyhow::anyhow!("Bind address '{}' is not an IP address", addr))?;
        }

        if self.timing.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        if self.timing.pacing_ms == 0 || self.timing.initial_rto_ms == 0 {
            anyhow::bail!("pacing_ms and initial_rto_ms must be non-zero");
        }
        if self.agent.data_queue_capacity == 0 {
            anyhow::bail!("data_queue_capacity must be non-zero");
        }

        Ok(())
    }

    /// Build the agent configuration, resolving STUN server names.
    ///
    /// # Errors
    ///
    /// Returns an error if a credential is missing, a STUN server does not
    /// resolve, or the agent rejects the result.
    pub async fn to_agent_config(&self) -> anyhow::Result<AgentConfig> {
        let section = &self.agent;
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Missing {} (set it in the config file or on the command line)", name))
        };
        let credentials = Credentials::new(
            required(&section.ufrag, "local ufrag")?,
            required(&section.pwd, "local password")?,
            required(&section.remote_ufrag, "remote ufrag")?,
            required(&section.remote_pwd, "remote password")?,
        );

        let mut config = AgentConfig::new(section.mid.clone(), credentials);
        config.enable_ipv6 = section.enable_ipv6;
        config.data_queue_capacity = section.data_queue_capacity;
        config.bind_addrs = section
            .bind_addrs
            .iter()
            .map(|addr| {
                addr.parse::<IpAddr>()
                    .with_context(|| format!("Invalid bind address '{addr}'"))
            })
            .collect::<anyhow::Result<_>>()?;
        config.stun_servers = resolve_servers(&section.stun_servers, section.enable_ipv6).await?;
        config.timing = CheckTiming {
            pacing: Duration::from_millis(self.timing.pacing_ms),
            initial_rto: Duration::from_millis(self.timing.initial_rto_ms),
            max_attempts: self.timing.max_attempts,
            idle_timeout: Duration::from_secs(self.timing.idle_timeout_secs),
            completion_timeout: self.timing.completion_timeout_secs.map(Duration::from_secs),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Resolve `host:port` names, keeping the first usable address of each
async fn resolve_servers(servers: &[String], enable_ipv6: bool) -> anyhow::Result<Vec<SocketAddr>> {
    let mut resolved = Vec::with_capacity(servers.len());
    for server in servers {
        let addr = tokio::net::lookup_host(server.as_str())
            .await
            .with_context(|| format!("Failed to resolve STUN server '{server}'"))?
            .find(|addr| enable_ipv6 || addr.is_ipv4())
            .ok_or_else(|| anyhow::anyhow!("STUN server '{}' has no usable address", server))?;
        tracing::debug!("STUN server {} resolved to {}", server, addr);
        resolved.push(addr);
    }
    Ok(resolved)
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    }

    let port_str = parts[0];
    let host = parts[1];

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;
    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }
    if host.contains('/') || host.contains('\\') || host.chars().any(char::is_whitespace) {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}

/// Random string over the alphanumeric subset of ice-char
fn random_ice_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
