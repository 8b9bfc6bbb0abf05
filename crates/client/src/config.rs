//! Configuration management for the Framewire client.
//!
//! The default configuration path is `~/.config/framewire/client.toml`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use protocol::ProtocolConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default server address.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:4040";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server_address must not be empty")]
    EmptyServerAddress,

    #[error("client_type must not be empty when set")]
    EmptyClientType,

    #[error("pending_capacity must be greater than 0, got {0}")]
    InvalidPendingCapacity(usize),

    #[error("initial_backoff_ms must be between 1 and max_backoff_ms ({max}), got {initial}")]
    InvalidBackoff { initial: u64, max: u64 },

    #[error("backoff_multiplier must be a finite number of at least 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("read_buffer_size must be between 64 and 16777216, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("outbound_capacity must be greater than 0, got {0}")]
    InvalidOutboundCapacity(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Framewire client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Connection configuration.
    pub client: ClientConfig,

    /// Wire settings, which must match the server's.
    pub protocol: ProtocolConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_address: String,

    /// Classification token sent as the first message on every connection.
    pub client_type: Option<String>,

    /// Reconnect automatically after the connection drops.
    pub always_reconnect: bool,

    /// Messages held while disconnected before sends are rejected.
    pub pending_capacity: usize,

    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds.
    pub max_backoff_ms: u64,

    /// Factor the delay grows by after each failed attempt.
    pub backoff_multiplier: f64,

    /// Size of the socket read buffer in bytes.
    pub read_buffer_size: usize,

    /// Frames the writer channel holds before sends wait.
    pub outbound_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily-rolling log files.
    pub directory: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            client_type: Some("UserClient".to_string()),
            always_reconnect: true,
            pending_capacity: 1024,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            read_buffer_size: 8192,
            outbound_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl ClientConfig {
    /// First reconnect delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound for the reconnect delay.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("framewire")
        .join("client.toml")
}

impl Config {
    /// Applies `FRAMEWIRE_*` environment overrides. Empty values are ignored.
    ///
    /// - FRAMEWIRE_SERVER_ADDRESS: Override server address
    /// - FRAMEWIRE_LOG_LEVEL: Override log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("FRAMEWIRE_SERVER_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding server_address from environment: {}", address);
                self.client.server_address = address;
            }
        }

        if let Ok(level) = std::env::var("FRAMEWIRE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Rejects settings the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;

        if client.server_address.trim().is_empty() {
            return Err(ConfigError::EmptyServerAddress);
        }

        if matches!(&client.client_type, Some(t) if t.is_empty()) {
            return Err(ConfigError::EmptyClientType);
        }

        if client.pending_capacity == 0 {
            return Err(ConfigError::InvalidPendingCapacity(client.pending_capacity));
        }

        if client.initial_backoff_ms == 0 || client.initial_backoff_ms > client.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: client.initial_backoff_ms,
                max: client.max_backoff_ms,
            });
        }

        if !client.backoff_multiplier.is_finite() || client.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(
                client.backoff_multiplier,
            ));
        }

        if !(64..=16 * 1024 * 1024).contains(&client.read_buffer_size) {
            return Err(ConfigError::InvalidReadBufferSize(client.read_buffer_size));
        }

        if client.outbound_capacity == 0 {
            return Err(ConfigError::InvalidOutboundCapacity(client.outbound_capacity));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Reads `path`, falling back to defaults when the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Reads the file at [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| anyhow!("malformed TOML: {}", describe_toml_error(&e)))
    }

    /// Writes the configuration as TOML, creating the parent directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("cannot write {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Appends the byte range of a TOML error when the parser reports one.
fn describe_toml_error(error: &toml::de::Error) -> String {
    let message = error.message().trim_end();
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", message, span.start, span.end),
        None => message.to_string(),
    }
}
