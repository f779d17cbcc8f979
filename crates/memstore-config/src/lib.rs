//! # memstore-config
//!
//! Configuration management for the memstore server.
//!
//! Loads configuration from:
//! 1. an explicit config file (`--config`), or else `~/.memstore/config.toml`
//! 2. environment variables (highest priority)
//!
//! A config file ending in `.toml` is parsed as TOML. Anything else is read as
//! `key:value` lines, one setting per line, with `#` comment lines.

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest usable Unix socket path (`sun_path` minus the trailing NUL)
const MAX_SOCKET_PATH: usize = 107;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("line {line}: expected `key:value`")]
    Syntax { line: usize },
    #[error("line {line}: invalid value for `{key}`: {value:?}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `explicit` if given, else from the global location,
    /// then apply environment overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::global_config_path() {
                Some(global) if global.exists() => Self::from_file(&global)?,
                _ => Config::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.memstore/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".memstore/config.toml"))
    }

    /// Read a config file, choosing the format by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "toml") {
            Ok(toml::from_str(&contents)?)
        } else {
            Self::parse_key_values(&contents)
        }
    }

    /// Parse the `key:value` format.
    ///
    /// Besides the canonical keys, the legacy names `n_thread`, `b_storage`
    /// (megabytes), `n_file_storage`, `soc_filename` and `max_conn_wait` are
    /// accepted. Unknown keys are logged and skipped.
    pub fn parse_key_values(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (key, value) = trimmed
                .split_once(':')
                .ok_or(ConfigError::Syntax { line })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "workers" | "n_thread" => config.server.workers = parse_value(line, key, value)?,
                "socket_path" | "soc_filename" => {
                    if value.is_empty() {
                        return Err(invalid_value(line, key, value));
                    }
                    config.server.socket_path = PathBuf::from(value);
                }
                "max_connections" | "max_conn_wait" => {
                    config.server.max_connections = parse_value(line, key, value)?
                }
                "poll_timeout_ms" => config.server.poll_timeout_ms = parse_value(line, key, value)?,
                "client_timeout_secs" => {
                    config.server.client_timeout_secs = parse_value(line, key, value)?
                }
                "capacity_bytes" => config.storage.capacity_bytes = parse_value(line, key, value)?,
                "b_storage" => {
                    let megabytes: u64 = parse_value(line, key, value)?;
                    config.storage.capacity_bytes = megabytes
                        .checked_mul(1024 * 1024)
                        .ok_or_else(|| invalid_value(line, key, value))?;
                }
                "max_files" | "n_file_storage" => {
                    config.storage.max_files = parse_value(line, key, value)?
                }
                "log_file" => config.log.file = PathBuf::from(value),
                _ => warn!(key, line, "Ignoring unknown configuration key"),
            }
        }

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("MEMSTORE_SOCKET") {
            self.server.socket_path = PathBuf::from(path);
        }
        if let Some(workers) = lookup("MEMSTORE_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.server.workers = n;
            }
        }
        if let Some(capacity) = lookup("MEMSTORE_CAPACITY_BYTES") {
            if let Ok(n) = capacity.parse() {
                self.storage.capacity_bytes = n;
            }
        }
        if let Some(path) = lookup("MEMSTORE_LOG_FILE") {
            self.log.file = PathBuf::from(path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.storage.capacity_bytes == 0 || self.storage.max_files == 0 {
            return Err(ConfigError::Invalid(
                "storage capacities must be non-zero".into(),
            ));
        }
        let socket_len = self.server.socket_path.as_os_str().len();
        if socket_len == 0 || socket_len > MAX_SOCKET_PATH {
            return Err(ConfigError::Invalid(format!(
                "socket path must be 1..={} bytes, got {}",
                MAX_SOCKET_PATH, socket_len
            )));
        }
        Ok(())
    }

    /// Render this configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Config::default().to_toml()
    }
}

fn invalid_value(line: usize, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        line,
        key: key.to_owned(),
        value: value.to_owned(),
    }
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid_value(line, key, value))
}

/// Listener, worker pool and connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Number of worker threads
    pub workers: usize,
    /// Ceiling on simultaneously open client connections
    pub max_connections: usize,
    /// Readiness poll timeout
    pub poll_timeout_ms: u16,
    /// Idle connections are closed after this long; 0 disables the timeout
    pub client_timeout_secs: u64,
}

impl ServerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_timeout_ms))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(memstore_ipc::default_socket_path()),
            workers: 4,
            max_connections: 64,
            poll_timeout_ms: 100,
            client_timeout_secs: 60,
        }
    }
}

/// Capacity of the in-memory store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Total bytes of file content held at once
    pub capacity_bytes: u64,
    /// Total number of files held at once
    pub max_files: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 100 * 1024 * 1024,
            max_files: 100,
        }
    }
}

/// Operation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Append-only file receiving one line per store operation
    pub file: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("memstore.log"),
        }
    }
}
