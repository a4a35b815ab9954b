//! Data source gateway.

use async_trait::async_trait;

use crate::batch::Row;
use crate::errors::SourceError;
use crate::query::QuerySpec;

/// The query execution engine, as seen by sessions and query tasks.
///
/// Implementations must be cheap to share behind an `Arc`; every running
/// query task holds a handle and calls [`fetch_rows`](DataSource::fetch_rows)
/// concurrently with the others.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Tables a client may query.
    async fn list_tables(&self) -> Result<Vec<String>, SourceError>;

    /// Run one fetch for `spec`.
    async fn fetch_rows(&self, spec: &QuerySpec) -> Result<Vec<Row>, SourceError>;
}
