//! Error types shared across crates.

use thiserror::Error;

/// A [`QuerySpec`](crate::QuerySpec) that cannot be scheduled.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    /// Table mode with an empty table name.
    #[error("table name is empty")]
    EmptyTable,
    /// Raw-query mode with an empty statement.
    #[error("raw query is empty")]
    EmptyRawQuery,
    /// A fetch interval of zero would spin the task.
    #[error("fetch interval must be greater than zero")]
    ZeroInterval,
}

/// An inbound frame that could not be decoded into an action.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame has no string `action` field.
    #[error("missing action field")]
    MissingAction,
    /// The payload does not match the action's schema.
    #[error("invalid {action} payload: {reason}")]
    InvalidPayload {
        /// Action whose payload was rejected.
        action: &'static str,
        /// Human-readable reason.
        reason: String,
    },
}

/// Failure reported by a [`DataSource`](crate::DataSource).
#[derive(Clone, Debug, Error)]
pub enum SourceError {
    /// The backing store could not be reached.
    #[error("data source unavailable: {0}")]
    Unavailable(String),
    /// The statement failed to execute.
    #[error("query failed: {0}")]
    Query(String),
    /// The requested table does not exist.
    #[error("unknown table: {0}")]
    UnknownTable(String),
    /// The table name is not a plain identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    /// A raw query would modify data.
    #[error("statement is not read-only")]
    NotReadOnly,
    /// No pooled connection could be acquired.
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl SourceError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Query(_) => "query",
            Self::UnknownTable(_) => "unknown_table",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::NotReadOnly => "not_read_only",
            Self::Pool(_) => "pool",
        }
    }
}
