//! Configuration management for the Framewire server.
//!
//! Settings are read from a TOML file, then environment overrides, then
//! command-line flags. The default configuration path is `~/.config/framewire/server.toml`.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use protocol::ProtocolConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4040";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind_address must be a socket address like 0.0.0.0:4040, got {0}")]
    InvalidBindAddress(String),

    #[error("read_buffer_size must be between 64 and 16777216 bytes, got {0}")]
    InvalidReadBufferSize(usize),

    #[error("outbound_capacity must be greater than 0, got {0}")]
    InvalidOutboundCapacity(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Framewire server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Wire settings, which must match the clients'.
    pub protocol: ProtocolConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_address: String,

    /// Size of the per-connection socket read buffer.
    pub read_buffer_size: usize,

    /// Frames buffered per connection before sends report backpressure.
    pub outbound_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily-rolling log files. Logs go to stdout only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
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

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("framewire")
        .join("server.toml")
}

impl Config {
    /// Applies `FRAMEWIRE_*` environment overrides. Empty values are ignored.
    ///
    /// - FRAMEWIRE_BIND_ADDRESS: Override listen address
    /// - FRAMEWIRE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("FRAMEWIRE_BIND_ADDRESS") {
            if !address.is_empty() {
                tracing::info!("Overriding bind_address from environment: {}", address);
                self.server.bind_address = address;
            }
        }

        if let Ok(level) = std::env::var("FRAMEWIRE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Checks every value the server depends on at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        let size = self.server.read_buffer_size;
        if !(64..=16 * 1024 * 1024).contains(&size) {
            return Err(ConfigError::InvalidReadBufferSize(size));
        }

        if self.server.outbound_capacity == 0 {
            return Err(ConfigError::InvalidOutboundCapacity(
                self.server.outbound_capacity,
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Parsed listen address.
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_address.clone()))
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
