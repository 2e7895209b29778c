//! SQLite-backed `StaleSink` (§4.8). A single bulk upsert per flush;
//! callers treat failures as best-effort and swallow them (§4.8).

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::collaborators::StaleSink;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS stale_tickers (
    ticker TEXT PRIMARY KEY,
    marked_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

pub struct SqliteStaleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStaleStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open stale store at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize stale_tickers schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl StaleSink for SqliteStaleStore {
    async fn mark_stale(&self, tickers: &[String]) -> Result<()> {
        if tickers.is_empty() {
            return Ok(());
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin stale-mark transaction")?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO stale_tickers (ticker, marked_at) VALUES (?1, ?2)
                 ON CONFLICT(ticker) DO UPDATE SET marked_at = excluded.marked_at",
            )?;
            for ticker in tickers {
                stmt.execute(rusqlite::params![ticker, now_ms])?;
            }
        }
        tx.commit().context("failed to commit stale-mark transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_updates_tickers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.db");
        let store = SqliteStaleStore::new(path.to_str().unwrap()).unwrap();

        store
            .mark_stale(&["AAPL".to_string(), "MSFT".to_string()])
            .await
            .unwrap();

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM stale_tickers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        // Re-marking the same ticker updates rather than duplicating.
        store.mark_stale(&["AAPL".to_string()]).await.unwrap();
        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM stale_tickers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.db");
        let store = SqliteStaleStore::new(path.to_str().unwrap()).unwrap();
        store.mark_stale(&[]).await.unwrap();
    }
}
