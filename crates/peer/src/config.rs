//! Configuration management for the p2p-chat peer.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/p2p-chat/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{KeySource, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::direct::DEFAULT_READ_BUFFER_SIZE;
use crate::network::negotiation::{DEFAULT_CHANNEL_LABEL, DEFAULT_GATHER_TIMEOUT};
use crate::network::webrtc::DEFAULT_STUN_SERVERS;
use crate::network::{NegotiatorOptions, ReofferPolicy, WebRtcConfig};

/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "P2P_CHAT_LOG_LEVEL";

/// Environment variable overriding `security.secret_key`.
pub const ENV_SECRET_KEY: &str = "P2P_CHAT_SECRET_KEY";

/// Largest accepted `direct.read_buffer_size`.
const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Largest accepted `network.gather_timeout_secs`.
const MAX_GATHER_TIMEOUT_SECS: u64 = 300;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("gather_timeout_secs must be between 1 and 300, got {0}")]
    InvalidGatherTimeout(u64),

    #[error("read_buffer_size must be between 1 and 1048576, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("channel_label must not be empty")]
    EmptyChannelLabel,

    #[error("stun server must start with stun: or stuns:, got {0}")]
    InvalidStunServer(String),

    #[error("bind address must be host:port, got {0}")]
    InvalidBindAddress(String),

    #[error("secret_key must be 32 raw bytes or base64 of 32 bytes")]
    InvalidSecretKey,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,

    /// Negotiation and ICE settings.
    pub network: NetworkConfig,

    /// Direct TCP transport settings.
    pub direct: DirectConfig,

    /// WebSocket relay settings.
    pub relay: RelayConfig,

    /// Envelope key settings.
    pub security: SecurityConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    pub directory: Option<PathBuf>,
}

/// Negotiation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// STUN servers used for candidate gathering.
    pub stun_servers: Vec<String>,

    /// Label of the data channel created when offering.
    pub channel_label: String,

    /// Maximum time to wait for candidate gathering, in seconds.
    pub gather_timeout_secs: u64,

    /// Handling of offers received while a cycle is in flight.
    pub reoffer_policy: ReofferPolicy,
}

/// Direct transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectConfig {
    /// Address `listen` binds to.
    pub bind_address: String,

    /// Maximum bytes per read from the connection.
    pub read_buffer_size: usize,
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address `relay` binds to.
    pub bind_address: String,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Envelope key, as 32 raw bytes or base64 of 32 bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Use the built-in key when no key is configured.
    pub allow_fallback_key: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            gather_timeout_secs: DEFAULT_GATHER_TIMEOUT.as_secs(),
            reoffer_policy: ReofferPolicy::default(),
        }
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            allow_fallback_key: true,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("p2p-chat")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - P2P_CHAT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - P2P_CHAT_SECRET_KEY: Override the envelope key
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(key) = std::env::var(ENV_SECRET_KEY) {
            if !key.is_empty() {
                tracing::info!("Using secret key from {}", ENV_SECRET_KEY);
                self.security.secret_key = Some(key);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        let timeout = self.network.gather_timeout_secs;
        if !(1..=MAX_GATHER_TIMEOUT_SECS).contains(&timeout) {
            return Err(ConfigError::InvalidGatherTimeout(timeout));
        }

        if self.network.channel_label.trim().is_empty() {
            return Err(ConfigError::EmptyChannelLabel);
        }

        for server in &self.network.stun_servers {
            if !server.starts_with("stun:") && !server.starts_with("stuns:") {
                return Err(ConfigError::InvalidStunServer(server.clone()));
            }
        }

        let size = self.direct.read_buffer_size;
        if !(1..=MAX_READ_BUFFER_SIZE).contains(&size) {
            return Err(ConfigError::InvalidReadBufferSize(size));
        }

        validate_bind_address(&self.direct.bind_address)?;
        validate_bind_address(&self.relay.bind_address)?;

        if let Some(key) = self.security.secret_key.as_deref() {
            if !key.trim().is_empty() && SecretKey::parse(key).is_err() {
                return Err(ConfigError::InvalidSecretKey);
            }
        }

        Ok(())
    }

    /// Options for the session negotiator.
    pub fn negotiator_options(&self) -> NegotiatorOptions {
        NegotiatorOptions {
            channel_label: self.network.channel_label.clone(),
            gather_timeout: Duration::from_secs(self.network.gather_timeout_secs),
            reoffer_policy: self.network.reoffer_policy,
        }
    }

    /// ICE configuration for the WebRTC engine.
    pub fn webrtc_config(&self) -> WebRtcConfig {
        WebRtcConfig::from_stun_urls(self.network.stun_servers.iter().cloned())
    }

    /// Resolves the envelope key from `security`.
    pub fn resolve_key(&self) -> protocol::Result<(SecretKey, KeySource)> {
        SecretKey::resolve(
            self.security.secret_key.as_deref(),
            self.security.allow_fallback_key,
        )
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn validate_bind_address(address: &str) -> Result<(), ConfigError> {
    let valid = address
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidBindAddress(address.to_string()))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
