//! # logzy
//!
//! Server binary: loads settings, opens the `SQLite` source and serves
//! streaming query results over WebSocket.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use logzy_core::DataSource;
use logzy_server::{LogzyServer, ServerConfig};
use logzy_settings::LogzySettings;
use logzy_source::{SqliteConfig, SqliteSource};

/// Grace period for connections to close before sessions are force-closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Streams periodically refreshed query results to WebSocket clients.
#[derive(Parser, Debug)]
#[command(name = "logzy", version, about)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// `SQLite` database to query (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file. Defaults to `~/.logzy/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Create the demo `logs` table if needed and append sample rows.
    #[arg(long)]
    seed_demo: bool,
}

impl Cli {
    fn apply(&self, settings: &mut LogzySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db_path) = &self.db_path {
            settings.source.db_path.clone_from(db_path);
        }
        if self.debug {
            settings.logging.level = "debug".into();
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_source(settings: &LogzySettings, seed_demo: bool) -> Result<SqliteSource> {
    let db_path = &settings.source.db_path;
    ensure_parent_dir(db_path)?;
    let config = SqliteConfig {
        pool_size: settings.source.pool_size,
        busy_timeout_ms: settings.source.busy_timeout_ms,
        row_limit: settings.source.row_limit,
    };
    let source = SqliteSource::open(db_path, &config)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    if seed_demo {
        let rows = source.seed_demo().context("Failed to seed demo table")?;
        tracing::info!(rows, "demo logs table seeded");
    }
    Ok(source)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.config.clone().unwrap_or_else(logzy_settings::settings_path);
    let mut settings = logzy_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    args.apply(&mut settings);

    logzy_logging::init_subscriber(&settings.logging);

    let source: Arc<dyn DataSource> = Arc::new(open_source(&settings, args.seed_demo)?);
    tracing::info!(db = %settings.source.db_path.display(), "data source ready");

    let metrics = logzy_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = LogzyServer::new(ServerConfig::from(&settings), source).with_metrics(metrics);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("logzy listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let forced = server.shutdown_gracefully(SHUTDOWN_GRACE).await;
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(SHUTDOWN_GRACE))
        .await;

    tracing::info!(forced, "Shutdown complete");
    Ok(())
}
