//! Server configuration.

use std::time::Duration;

use logzy_settings::LogzySettings;

/// Runtime configuration for [`LogzyServer`](crate::LogzyServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Maximum concurrently open sessions.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Interval between server pings on idle connections.
    pub heartbeat_interval: Duration,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval applied to queries submitted without one.
    pub default_fetch_interval_secs: u16,
    /// Intervals advertised in the `init` reply.
    pub fetch_intervals: Vec<u16>,
    /// How long a replacement or close waits for a cancelled task.
    pub cancel_ack_timeout: Duration,
    /// How long a closing connection waits for its outbound queue to drain.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&LogzySettings::default())
    }
}

impl From<&LogzySettings> for ServerConfig {
    fn from(settings: &LogzySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            outbound_queue: settings.server.outbound_queue,
            heartbeat_interval: Duration::from_secs(settings.server.heartbeat_interval_secs),
            max_message_size: settings.server.max_message_size,
            default_fetch_interval_secs: settings.session.default_fetch_interval_secs,
            fetch_intervals: settings.session.fetch_intervals.clone(),
            cancel_ack_timeout: Duration::from_millis(settings.session.cancel_ack_timeout_ms),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
