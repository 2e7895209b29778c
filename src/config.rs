//! Environment-driven configuration, loaded once at startup.
//!
//! Follows this crate's existing convention for resolving on-disk defaults:
//! relative paths are anchored to `CARGO_MANIFEST_DIR` rather than the
//! caller's cwd, so running the binary from the repo root or from
//! `target/release/` behaves the same way.

use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub symbol_table_path: String,
    pub rollup_db_path: String,
    pub stale_db_path: String,
    pub aggregator_flush_threshold: usize,
    pub aggregator_flush_timeout_secs: u64,
    pub session_send_queue_capacity: usize,
    pub replay_buffer_lookahead_ms: i64,
    pub replay_tick_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_flush_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            symbol_table_path: resolve_data_path(
                env::var("SYMBOL_TABLE_PATH").ok(),
                "symbols.csv",
            ),
            rollup_db_path: resolve_data_path(env::var("ROLLUP_DB_PATH").ok(), "rollups.db"),
            stale_db_path: resolve_data_path(env::var("STALE_DB_PATH").ok(), "stale.db"),
            aggregator_flush_threshold: env_parse("AGG_FLUSH_THRESHOLD", 7_500),
            aggregator_flush_timeout_secs: env_parse("AGG_FLUSH_TIMEOUT_SECS", 2),
            session_send_queue_capacity: env_parse("SESSION_QUEUE_CAPACITY", 256),
            replay_buffer_lookahead_ms: env_parse("REPLAY_BUFFER_MS", 10_000),
            replay_tick_interval_ms: env_parse("REPLAY_TICK_MS", 30),
            heartbeat_interval_secs: env_parse("HEARTBEAT_SECS", 2),
            stale_flush_interval_ms: env_parse("STALE_FLUSH_MS", 250),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn default_data_path(filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

/// Loads `.env` the same way as the env search used elsewhere in this
/// codebase: standard cwd/parent search, then manifest-dir-relative
/// fallbacks so `cargo run --manifest-path` from another directory works.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    for p in [manifest_dir.join(".env"), manifest_dir.join("../.env")] {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
