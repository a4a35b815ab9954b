//! Query specifications.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SpecError;

/// One query a client asked to have streamed.
///
/// In table mode `table` names the table to read. In raw-query mode
/// `raw_query` holds the statement and `table` is only a label for the
/// batches it produces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Table to read, or the label of a raw query.
    pub table: String,
    /// Statement executed verbatim instead of the table scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_query: Option<String>,
    /// Seconds between fetches.
    #[serde(rename = "fetch_interval")]
    pub fetch_interval_secs: u16,
}

impl QuerySpec {
    /// Table-mode spec.
    pub fn table(table: impl Into<String>, fetch_interval_secs: u16) -> Self {
        Self {
            table: table.into(),
            raw_query: None,
            fetch_interval_secs,
        }
    }

    /// Raw-query spec, labelled `label`.
    pub fn raw(label: impl Into<String>, query: impl Into<String>, fetch_interval_secs: u16) -> Self {
        Self {
            table: label.into(),
            raw_query: Some(query.into()),
            fetch_interval_secs,
        }
    }

    /// Whether this spec runs a raw statement.
    pub fn is_raw(&self) -> bool {
        self.raw_query.is_some()
    }

    /// Check the spec can be scheduled.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.fetch_interval_secs == 0 {
            return Err(SpecError::ZeroInterval);
        }
        match &self.raw_query {
            Some(q) if q.trim().is_empty() => Err(SpecError::EmptyRawQuery),
            Some(_) => Ok(()),
            None if self.table.trim().is_empty() => Err(SpecError::EmptyTable),
            None => Ok(()),
        }
    }

    /// The fetch interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.fetch_interval_secs))
    }
}
