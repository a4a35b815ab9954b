//! JSON wire protocol.
//!
//! Inbound frames (client → server):
//!
//! ```text
//! {"action": "init"}
//! {"action": "run_query", "payload": {"queries": [{"table": "logs", "fetch_interval": 5}]}}
//! ```
//!
//! Outbound frames (server → client):
//!
//! ```text
//! {"action": "init", "payload": {"tables": ["logs"], "fetch_intervals": [5, 10]}}
//! {"action": "query_result", "table": "logs", "results": [{"level": "warn", ...}]}
//! {"action": "error", "payload": {"message": "..."}}
//! ```
//!
//! Inbound payloads are decoded against a typed schema; a frame either yields
//! a complete [`InboundAction`] or a [`ProtocolError`], never a partial value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::{ResultBatch, Row};
use crate::errors::ProtocolError;
use crate::query::QuerySpec;

/// Label given to a raw query that arrives without a `table` label.
pub const RAW_QUERY_LABEL: &str = "raw_query";

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundAction {
    /// Ask for the list of queryable tables.
    Init,
    /// Replace the session's running queries.
    RunQuery {
        /// The new query set. Not yet validated.
        queries: Vec<QuerySpec>,
    },
    /// An action this server does not understand.
    Unknown(String),
}

#[derive(Deserialize)]
struct RunQueryPayload {
    queries: Vec<WireQuery>,
}

#[derive(Deserialize)]
struct WireQuery {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    raw_query: Option<String>,
    #[serde(default)]
    fetch_interval: Option<u16>,
}

impl InboundAction {
    /// Decode one inbound text frame.
    ///
    /// Queries without a `fetch_interval` (or with `null`) receive
    /// `default_fetch_interval`.
    pub fn parse(text: &str, default_fetch_interval: u16) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingAction)?;

        match action {
            "init" => Ok(Self::Init),
            "run_query" => {
                let payload = value
                    .get("payload")
                    .cloned()
                    .ok_or_else(|| invalid_run_query("payload is missing"))?;
                let payload: RunQueryPayload = serde_json::from_value(payload)
                    .map_err(|e| invalid_run_query(e.to_string()))?;

                let queries = payload
                    .queries
                    .into_iter()
                    .enumerate()
                    .map(|(index, q)| q.into_spec(index, default_fetch_interval))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::RunQuery { queries })
            }
            other => Ok(Self::Unknown(other.to_owned())),
        }
    }

    /// Wire name of the action.
    pub fn name(&self) -> &str {
        match self {
            Self::Init => "init",
            Self::RunQuery { .. } => "run_query",
            Self::Unknown(name) => name,
        }
    }
}

impl WireQuery {
    fn into_spec(self, index: usize, default_fetch_interval: u16) -> Result<QuerySpec, ProtocolError> {
        let fetch_interval_secs = self.fetch_interval.unwrap_or(default_fetch_interval);
        match (self.table, self.raw_query) {
            (table, Some(raw)) => Ok(QuerySpec {
                table: table.unwrap_or_else(|| RAW_QUERY_LABEL.to_owned()),
                raw_query: Some(raw),
                fetch_interval_secs,
            }),
            (Some(table), None) => Ok(QuerySpec::table(table, fetch_interval_secs)),
            (None, None) => Err(invalid_run_query(format!(
                "query {index} has neither table nor raw_query"
            ))),
        }
    }
}

fn invalid_run_query(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        action: "run_query",
        reason: reason.into(),
    }
}

/// Payload of the `init` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPayload {
    /// Tables the data source exposes.
    pub tables: Vec<String>,
    /// Fetch intervals the client may offer.
    #[serde(default)]
    pub fetch_intervals: Vec<u16>,
}

/// Payload of an `error` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
}

/// A frame sent to the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Reply to `init`.
    Init {
        /// Table list and interval choices.
        payload: InitPayload,
    },
    /// One batch from a running query.
    QueryResult {
        /// Label of the producing query.
        table: String,
        /// Fetched rows.
        results: Vec<Row>,
    },
    /// A request was rejected or could not be served.
    Error {
        /// What went wrong.
        payload: ErrorPayload,
    },
}

impl OutboundMessage {
    /// Build the `init` reply.
    pub fn init_reply(tables: Vec<String>, fetch_intervals: Vec<u16>) -> Self {
        Self::Init {
            payload: InitPayload {
                tables,
                fetch_intervals,
            },
        }
    }

    /// Build an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }

    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::QueryResult { .. } => "query_result",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ResultBatch> for OutboundMessage {
    fn from(batch: ResultBatch) -> Self {
        Self::QueryResult {
            table: batch.table,
            results: batch.rows,
        }
    }
}
