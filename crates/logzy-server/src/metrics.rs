//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Connections rejected at capacity (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Open sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Running query tasks (gauge).
pub const QUERY_TASKS_ACTIVE: &str = "query_tasks_active";
/// Fetches attempted (counter).
pub const QUERY_FETCHES_TOTAL: &str = "query_fetches_total";
/// Failed fetches (counter, labels: kind).
pub const QUERY_FETCH_ERRORS_TOTAL: &str = "query_fetch_errors_total";
/// Result batches written to clients (counter).
pub const QUERY_BATCHES_RELAYED_TOTAL: &str = "query_batches_relayed_total";
/// Result batches discarded because their query set was replaced (counter).
pub const QUERY_BATCHES_STALE_TOTAL: &str = "query_batches_stale_total";
