//! Rows produced by a fetch.

use serde::{Deserialize, Serialize};

/// One row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The rows returned by a single fetch of a single query.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBatch {
    /// Label of the query that produced the batch.
    pub table: String,
    /// Fetched rows, in the order the source returned them.
    pub rows: Vec<Row>,
}

impl ResultBatch {
    /// Create a batch for `table`.
    pub fn new(table: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            table: table.into(),
            rows,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the fetch returned nothing.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
