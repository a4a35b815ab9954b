//! Settings type definitions.
//!
//! Every section implements [`Default`] with production values and is marked
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogzySettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Data source connection.
    pub source: SourceSettings,
    /// Per-session query scheduling.
    pub session: SessionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl LogzySettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outbound_queue must be positive".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_connections must be positive".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.source.pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "source.pool_size must be positive".into(),
            ));
        }
        if self.source.row_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "source.row_limit must be positive".into(),
            ));
        }
        if self.session.default_fetch_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "session.default_fetch_interval_secs must be positive".into(),
            ));
        }
        if self.session.cancel_ack_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.cancel_ack_timeout_ms must be positive".into(),
            ));
        }
        if self.session.fetch_intervals.contains(&0) {
            return Err(SettingsError::InvalidValue(
                "session.fetch_intervals must not contain 0".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrently open sessions.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            max_connections: 256,
            outbound_queue: 256,
            heartbeat_interval_secs: 30,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Data source settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// `SQLite` database file.
    pub db_path: PathBuf,
    /// Connection pool size.
    pub pool_size: u32,
    /// Maximum rows returned per fetch.
    pub row_limit: usize,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            db_path: logzy_home().join("logzy.db"),
            pool_size: 4,
            row_limit: 100,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Query scheduling settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval applied to queries that arrive without one.
    pub default_fetch_interval_secs: u16,
    /// How long a replacement waits for a cancelled task to finish.
    pub cancel_ack_timeout_ms: u64,
    /// Intervals offered to clients in the `init` reply.
    pub fetch_intervals: Vec<u16>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_fetch_interval_secs: 5,
            cancel_ack_timeout_ms: 1_000,
            fetch_intervals: vec![5, 10, 15, 30, 60, 120, 240],
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive. `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// `~/.logzy`, falling back to `/tmp/.logzy` without a home directory.
pub fn logzy_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".logzy")
}
