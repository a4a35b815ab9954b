//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Number of open sessions.
    pub active_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions: sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 3);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.active_sessions, 3);
    }

    #[test]
    fn serializes_fields() {
        let json = serde_json::to_value(health_check(Instant::now(), 0)).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].is_u64());
        assert_eq!(json["active_sessions"], 0);
    }
}
