//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LogzySettings, logzy_home};

/// Resolve the default settings file (`~/.logzy/settings.json`).
pub fn settings_path() -> PathBuf {
    logzy_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LogzySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LogzySettings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<LogzySettings> {
    let defaults = serde_json::to_value(LogzySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LOGZY_*` overrides read through `lookup`.
///
/// Invalid values are ignored with a warning, keeping the file/default value.
pub fn apply_overrides<F>(settings: &mut LogzySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = read("LOGZY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("LOGZY_PORT") {
        match parse_u64_range(&v, 1, u64::from(u16::MAX)) {
            Some(port) => settings.server.port = port as u16,
            None => warn!(key = "LOGZY_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("LOGZY_MAX_CONNECTIONS") {
        match parse_u64_range(&v, 1, 100_000) {
            Some(n) => settings.server.max_connections = n as usize,
            None => warn!(key = "LOGZY_MAX_CONNECTIONS", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LOGZY_OUTBOUND_QUEUE") {
        match parse_u64_range(&v, 1, 1_000_000) {
            Some(n) => settings.server.outbound_queue = n as usize,
            None => warn!(key = "LOGZY_OUTBOUND_QUEUE", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LOGZY_DB_PATH") {
        settings.source.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("LOGZY_ROW_LIMIT") {
        match parse_u64_range(&v, 1, 1_000_000) {
            Some(n) => settings.source.row_limit = n as usize,
            None => warn!(key = "LOGZY_ROW_LIMIT", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LOGZY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("LOGZY_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => warn!(key = "LOGZY_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("LOGZY_DEBUG") {
        match parse_bool(&v) {
            Some(true) => settings.logging.level = "debug".into(),
            Some(false) => {}
            None => warn!(key = "LOGZY_DEBUG", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
