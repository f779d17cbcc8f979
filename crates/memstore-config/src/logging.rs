//! Structured logging utilities for memstore components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use memstore_config::{log_conn_debug, log_worker_warn};
//!
//! log_conn_debug!("Connection accepted", client = 7);
//! log_worker_warn!("Malformed request", worker = 2);
//! ```

use std::fmt;
use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const SERVER: &'static str = "SERVER";
    pub const WORKER: &'static str = "WORKER";
    pub const STORE: &'static str = "STORE";
    pub const CONN: &'static str = "CONN";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === SERVER logging macros ===

#[macro_export]
macro_rules! log_server_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "SERVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_server_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "SERVER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_server_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "SERVER", $($key = $value,)* $msg)
    };
}

// === WORKER logging macros ===

#[macro_export]
macro_rules! log_worker_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "WORKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_worker_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "WORKER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_worker_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "WORKER", $($key = $value,)* $msg)
    };
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORE", $($key = $value,)* $msg)
    };
}

// === CONN logging macros ===

#[macro_export]
macro_rules! log_conn_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CONN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_conn_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CONN", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// `RUST_LOG`, when set, takes precedence. Call this once at startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
