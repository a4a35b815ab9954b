//! `SQLite` data source.
//!
//! Uses an `r2d2` pool of `rusqlite` connections. Every fetch runs on the
//! blocking thread pool so a slow statement stalls only the query task that
//! issued it.
//!
//! Table mode reads `SELECT * FROM "<table>" LIMIT <row_limit>` after checking
//! the name is a plain identifier that exists. Raw-query mode executes the
//! statement as given but refuses anything that is not read-only.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Statement};
use serde_json::Value;
use tracing::{debug, info};

use logzy_core::{DataSource, QuerySpec, Row, SourceError};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Configuration for [`SqliteSource`].
#[derive(Clone, Debug)]
pub struct SqliteConfig {
    /// Maximum pool size (default: 4).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 5000).
    pub busy_timeout_ms: u32,
    /// Maximum rows returned per fetch (default: 100).
    pub row_limit: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            busy_timeout_ms: 5_000,
            row_limit: 100,
        }
    }
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

/// A [`DataSource`] reading from a `SQLite` database file.
#[derive(Clone)]
pub struct SqliteSource {
    pool: ConnectionPool,
    row_limit: usize,
}

impl SqliteSource {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, config: &SqliteConfig) -> Result<Self, SourceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SourceError::Unavailable(format!("create dir: {e}")))?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| SourceError::Pool(e.to_string()))?;

        info!(path = %path.display(), pool_size = config.pool_size, "sqlite source opened");
        Ok(Self::from_pool(pool, config.row_limit))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: ConnectionPool, row_limit: usize) -> Self {
        Self { pool, row_limit }
    }

    /// Maximum rows per fetch.
    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    /// Create the demo `logs` table and fill it with a few entries.
    ///
    /// Returns the number of rows inserted.
    pub fn seed_demo(&self) -> Result<usize, SourceError> {
        let mut conn = self.pool.get().map_err(|e| SourceError::Pool(e.to_string()))?;
        let tx = conn.transaction().map_err(query_err)?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS logs (
                 time TEXT NOT NULL,
                 date TEXT NOT NULL,
                 category TEXT NOT NULL,
                 level TEXT NOT NULL,
                 log TEXT NOT NULL
             );",
        )
        .map_err(query_err)?;

        let now = chrono::Utc::now();
        let entries = [
            ("http", "info", "GET /health 200"),
            ("http", "warn", "GET /ws upgrade took 812ms"),
            ("db", "error", "connection reset by peer"),
            ("auth", "info", "session refreshed"),
            ("worker", "debug", "queue drained"),
        ];
        for (offset, (category, level, log)) in entries.iter().enumerate() {
            let at = now - chrono::Duration::seconds(offset as i64);
            let _ = tx
                .execute(
                    "INSERT INTO logs (time, date, category, level, log) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        at.to_rfc3339(),
                        at.date_naive().to_string(),
                        category,
                        level,
                        log
                    ],
                )
                .map_err(query_err)?;
        }
        tx.commit().map_err(query_err)?;

        info!(rows = entries.len(), "seeded demo logs table");
        Ok(entries.len())
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn list_tables(&self) -> Result<Vec<String>, SourceError> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| SourceError::Pool(e.to_string()))?;
            list_tables(&conn)
        })
        .await
    }

    async fn fetch_rows(&self, spec: &QuerySpec) -> Result<Vec<Row>, SourceError> {
        let pool = self.pool.clone();
        let spec = spec.clone();
        let limit = self.row_limit;
        run_blocking(move || {
            let conn = pool.get().map_err(|e| SourceError::Pool(e.to_string()))?;
            fetch(&conn, &spec, limit)
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SourceError>
where
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SourceError::Unavailable(format!("fetch worker failed: {e}")))?
}

fn list_tables(conn: &Connection) -> Result<Vec<String>, SourceError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(query_err)?;
    stmt.query_map([], |row| row.get::<_, String>(0))
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)
}

fn fetch(conn: &Connection, spec: &QuerySpec, limit: usize) -> Result<Vec<Row>, SourceError> {
    if let Some(raw) = &spec.raw_query {
        let mut stmt = conn.prepare(raw).map_err(query_err)?;
        if !stmt.readonly() {
            return Err(SourceError::NotReadOnly);
        }
        debug!(label = %spec.table, "running raw query");
        return collect_rows(&mut stmt, [], limit);
    }

    let table = spec.table.as_str();
    if !is_identifier(table) {
        return Err(SourceError::InvalidIdentifier(table.to_owned()));
    }
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .map_err(query_err)?;
    if !exists {
        return Err(SourceError::UnknownTable(table.to_owned()));
    }

    let mut stmt = conn
        .prepare(&format!("SELECT * FROM \"{table}\" LIMIT ?1"))
        .map_err(query_err)?;
    let sql_limit = i64::try_from(limit).unwrap_or(i64::MAX);
    collect_rows(&mut stmt, [sql_limit], limit)
}

fn collect_rows<P: rusqlite::Params>(
    stmt: &mut Statement<'_>,
    params: P,
    limit: usize,
) -> Result<Vec<Row>, SourceError> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
    let mut rows = stmt.query(params).map_err(query_err)?;

    let mut out = Vec::new();
    while out.len() < limit {
        let Some(row) = rows.next().map_err(query_err)? else {
            break;
        };
        let mut map = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(query_err)?;
            let _ = map.insert(name.clone(), to_json(value));
        }
        out.push(map);
    }
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(bytes.iter().map(|b| format!("{b:02x}")).collect()),
    }
}

/// Plain SQL identifier: ASCII letters, digits and underscores, not starting with a digit.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn query_err(e: rusqlite::Error) -> SourceError {
    SourceError::Query(e.to_string())
}
