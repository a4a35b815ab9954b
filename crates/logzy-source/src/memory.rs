//! In-process data source.
//!
//! Holds tables as vectors of rows. Failures and fetch latency can be
//! scripted, which makes it the gateway of choice for exercising query tasks
//! and sessions without a database.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use logzy_core::{DataSource, QuerySpec, Row, SourceError};

/// A [`DataSource`] backed by in-memory tables.
#[derive(Default)]
pub struct MemorySource {
    tables: RwLock<BTreeMap<String, Vec<Row>>>,
    scripted_failures: Mutex<VecDeque<SourceError>>,
    unavailable: AtomicBool,
    latency: Option<Duration>,
    fetches: AtomicU64,
}

impl MemorySource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table (builder style).
    #[must_use]
    pub fn with_table(self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        let _ = self.tables.write().insert(name.into(), rows);
        self
    }

    /// Delay every fetch by `latency` (builder style).
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace the contents of a table, creating it if needed.
    pub fn set_table(&self, name: impl Into<String>, rows: Vec<Row>) {
        let _ = self.tables.write().insert(name.into(), rows);
    }

    /// Append a row to an existing table, creating it if needed.
    pub fn push_row(&self, table: &str, row: Row) {
        self.tables.write().entry(table.to_owned()).or_default().push(row);
    }

    /// Fail the next fetch with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: SourceError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Make every call fail with [`SourceError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `fetch_rows` calls started so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source offline".into()));
        }
        Ok(self.tables.read().keys().cloned().collect())
    }

    async fn fetch_rows(&self, spec: &QuerySpec) -> Result<Vec<Row>, SourceError> {
        let _ = self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source offline".into()));
        }
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if spec.is_raw() {
            return Err(SourceError::Query(
                "raw queries are not supported by the memory source".into(),
            ));
        }

        self.tables
            .read()
            .get(&spec.table)
            .cloned()
            .ok_or_else(|| SourceError::UnknownTable(spec.table.clone()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn row(level: &str) -> Row {
        let mut row = Row::new();
        let _ = row.insert("level".into(), json!(level));
        row
    }

    #[tokio::test]
    async fn lists_tables_sorted() {
        let source = MemorySource::new()
            .with_table("logs", vec![])
            .with_table("events", vec![]);
        assert_eq!(source.list_tables().await.unwrap(), vec!["events", "logs"]);
    }

    #[tokio::test]
    async fn fetch_returns_rows() {
        let source = MemorySource::new().with_table("logs", vec![row("info"), row("warn")]);
        let rows = source.fetch_rows(&QuerySpec::table("logs", 5)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["level"], "warn");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_table() {
        let source = MemorySource::new();
        let err = source.fetch_rows(&QuerySpec::table("nope", 5)).await.unwrap_err();
        assert_matches!(err, SourceError::UnknownTable(t) if t == "nope");
    }

    #[tokio::test]
    async fn scripted_failure_consumed_once() {
        let source = MemorySource::new().with_table("logs", vec![row("info")]);
        source.fail_next(SourceError::Query("boom".into()));

        let spec = QuerySpec::table("logs", 5);
        assert_matches!(source.fetch_rows(&spec).await, Err(SourceError::Query(_)));
        assert!(source.fetch_rows(&spec).await.is_ok());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn unavailable_until_reset() {
        let source = MemorySource::new().with_table("logs", vec![]);
        source.set_unavailable(true);
        assert_matches!(source.list_tables().await, Err(SourceError::Unavailable(_)));
        assert_matches!(
            source.fetch_rows(&QuerySpec::table("logs", 5)).await,
            Err(SourceError::Unavailable(_))
        );
        source.set_unavailable(false);
        assert!(source.fetch_rows(&QuerySpec::table("logs", 5)).await.is_ok());
    }

    #[tokio::test]
    async fn push_row_appends() {
        let source = MemorySource::new();
        source.push_row("logs", row("info"));
        source.push_row("logs", row("error"));
        let rows = source.fetch_rows(&QuerySpec::table("logs", 5)).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_fetch() {
        let source = MemorySource::new()
            .with_table("logs", vec![])
            .with_latency(Duration::from_secs(3));
        let start = tokio::time::Instant::now();
        let _ = source.fetch_rows(&QuerySpec::table("logs", 5)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn raw_queries_unsupported() {
        let source = MemorySource::new();
        assert_matches!(
            source.fetch_rows(&QuerySpec::raw("q", "SELECT 1", 5)).await,
            Err(SourceError::Query(_))
        );
    }
}
