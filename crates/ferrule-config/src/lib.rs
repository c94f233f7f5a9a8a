#![deny(unsafe_code)]

//! Configuration loading and validation for Ferrule.
//!
//! Loads TOML configuration files and validates them against expected
//! schemas. Provides the [`AppConfig`] type as the central configuration
//! structure; the channel-specific knobs live in [`ChannelConfig`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// IPC channel configuration.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for an IPC channel.
///
/// `max_sessions` must be at least `max_clients`; [`ChannelConfig::clamped`]
/// fixes up violating values with a logged warning rather than rejecting
/// them, matching the behavior of a live reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Directory the channel socket and lock file are created in.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Maximum number of concurrently connected clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,

    /// Maximum number of concurrent server sessions (>= max_clients).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Session I/O timeout in seconds. 0 means no timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// File mode applied to the channel socket (octal string, e.g. "0660").
    #[serde(default = "default_socket_mode")]
    pub socket_mode: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            max_clients: default_max_clients(),
            max_sessions: default_max_sessions(),
            timeout_secs: default_timeout_secs(),
            socket_mode: default_socket_mode(),
        }
    }
}

fn default_socket_dir() -> String {
    "/tmp/ferrule".to_string()
}

fn default_max_clients() -> u32 {
    16
}

fn default_max_sessions() -> u32 {
    32
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_socket_mode() -> String {
    "0660".to_string()
}

impl ChannelConfig {
    /// Parse the configured socket mode into permission bits.
    pub fn mode_bits(&self) -> Result<u32, ConfigError> {
        u32::from_str_radix(self.socket_mode.trim_start_matches("0o"), 8)
            .map_err(|_| {
                ConfigError::Validation(format!("invalid socket_mode: {:?}", self.socket_mode))
            })
            .and_then(|mode| {
                if mode > 0o777 {
                    Err(ConfigError::Validation(format!(
                        "socket_mode out of range: {:?}",
                        self.socket_mode
                    )))
                } else {
                    Ok(mode)
                }
            })
    }

    /// Return a copy with `max_sessions` clamped to be >= `max_clients`.
    ///
    /// A violating value is a warning, not an error, so that a live reload
    /// with a bad value degrades instead of failing.
    pub fn clamped(mut self) -> Self {
        if self.max_sessions < self.max_clients {
            warn!(
                max_clients = self.max_clients,
                max_sessions = self.max_sessions,
                "max_sessions below max_clients, clamping"
            );
            self.max_sessions = self.max_clients;
        }
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.max_clients == 0 {
            return Err(ConfigError::Validation(
                "channel.max_clients must be at least 1".to_string(),
            ));
        }
        self.channel.mode_bits()?;
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "unknown logging.level: {other:?}"
            ))),
        }
    }
}
