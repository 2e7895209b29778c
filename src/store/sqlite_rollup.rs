//! SQLite-backed `RollupStore` (§4.7, §6).
//!
//! The merge SQL in spec.md §6 is written against a Postgres-flavored
//! dialect (`date_trunc`, `GREATEST`/`LEAST`). This store targets SQLite
//! (the only SQL engine this codebase depends on, via `rusqlite`), so the
//! templates below are the SQLite-native equivalent of the same
//! semantics: minute/day bucketing via integer division of the epoch-ms
//! timestamp (timezone-invariant for minute; for day it coincides with
//! the NY trading day because regular-hours bars never cross a UTC date
//! boundary), and SQLite's multi-argument `max`/`min` standing in for
//! `GREATEST`/`LEAST`. The row-level merge semantics (open-if-null,
//! close=last, high=max, low=min, volume accumulates) are unchanged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;

use crate::aggregator::ScaledBarRow;
use crate::collaborators::RollupStore;

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 86_400_000;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ohlcv_1m (
    ticker TEXT NOT NULL,
    "timestamp" INTEGER NOT NULL,
    open INTEGER,
    close INTEGER,
    high INTEGER,
    low INTEGER,
    volume INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (ticker, "timestamp")
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS ohlcv_1d (
    ticker TEXT NOT NULL,
    "timestamp" INTEGER NOT NULL,
    open INTEGER,
    close INTEGER,
    high INTEGER,
    low INTEGER,
    volume INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (ticker, "timestamp")
) WITHOUT ROWID;
"#;

pub struct SqliteRollupStore {
    conn: Arc<Mutex<Connection>>,
    worker_id: String,
}

impl SqliteRollupStore {
    pub fn new(db_path: &str, worker_id: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open rollup store at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize ohlcv_1m/ohlcv_1d schema")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            worker_id: worker_id.to_string(),
        };
        store.create_staging_tables_sync()?;
        Ok(store)
    }

    fn stage_table_1m(&self) -> String {
        format!("stage_1m_{}", self.worker_id)
    }

    fn stage_table_1d(&self) -> String {
        format!("stage_1d_{}", self.worker_id)
    }

    fn create_staging_tables_sync(&self) -> Result<()> {
        let conn = self.conn.lock();
        for table in [self.stage_table_1m(), self.stage_table_1d()] {
            conn.execute_batch(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{table}" (
                    ticker TEXT,
                    volume INTEGER,
                    open INTEGER,
                    close INTEGER,
                    high INTEGER,
                    low INTEGER,
                    "timestamp" INTEGER,
                    transactions INTEGER
                );"#
            ))
            .with_context(|| format!("failed to create staging table {table}"))?;
        }
        Ok(())
    }

    fn merge_sync(&self, m1_rows: &[ScaledBarRow], d1_rows: &[ScaledBarRow]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin merge transaction")?;

        bulk_load_and_merge(&tx, &self.stage_table_1m(), "ohlcv_1m", m1_rows, MINUTE_MS)?;
        if !d1_rows.is_empty() {
            bulk_load_and_merge(&tx, &self.stage_table_1d(), "ohlcv_1d", d1_rows, DAY_MS)?;
        }

        tx.commit().context("failed to commit merge transaction")?;
        Ok(())
    }
}

fn bulk_load_and_merge(
    tx: &rusqlite::Transaction<'_>,
    stage_table: &str,
    rollup_table: &str,
    rows: &[ScaledBarRow],
    bucket_ms: i64,
) -> Result<()> {
    {
        let mut stmt = tx.prepare_cached(&format!(
            r#"INSERT INTO "{stage_table}"
               (ticker, volume, open, close, high, low, "timestamp", transactions)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)"#
        ))?;
        for row in rows {
            stmt.execute(params![
                row.ticker,
                row.volume,
                row.open,
                row.close,
                row.high,
                row.low,
                row.timestamp_ms,
            ])?;
        }
    }

    // Upsert-with-window-aggregation merge (§6), transliterated to SQLite:
    // bucket = (timestamp / bucket_ms) * bucket_ms stands in for date_trunc;
    // FIRST_VALUE(...) OVER (...) picks first_open/last_close per bucket;
    // the ON CONFLICT clause applies the idempotent accumulate-or-replace
    // rule per column.
    tx.execute(
        &format!(
            r#"
            INSERT INTO "{rollup_table}" (ticker, volume, open, close, high, low, "timestamp")
            SELECT ticker, SUM(volume), first_open, last_close, MAX(high), MIN(low), bucket
            FROM (
                SELECT ticker, volume, open, close, high, low, "timestamp",
                    FIRST_VALUE(open) OVER (
                        PARTITION BY ticker, ("timestamp" / {bucket_ms}) * {bucket_ms}
                        ORDER BY "timestamp" ASC
                    ) AS first_open,
                    FIRST_VALUE(close) OVER (
                        PARTITION BY ticker, ("timestamp" / {bucket_ms}) * {bucket_ms}
                        ORDER BY "timestamp" DESC
                    ) AS last_close,
                    ("timestamp" / {bucket_ms}) * {bucket_ms} AS bucket
                FROM "{stage_table}"
            ) s
            GROUP BY ticker, bucket, first_open, last_close
            ON CONFLICT(ticker, "timestamp") DO UPDATE SET
                high   = max("{rollup_table}".high, excluded.high),
                low    = min("{rollup_table}".low, excluded.low),
                close  = excluded.close,
                volume = "{rollup_table}".volume + excluded.volume,
                open   = COALESCE("{rollup_table}".open, excluded.open)
            "#
        ),
        [],
    )
    .with_context(|| format!("merge into {rollup_table} failed"))?;

    tx.execute(&format!(r#"DELETE FROM "{stage_table}""#), [])
        .with_context(|| format!("truncate of {stage_table} failed"))?;

    Ok(())
}

#[async_trait]
impl RollupStore for SqliteRollupStore {
    async fn merge_batch(&self, m1_rows: &[ScaledBarRow], d1_rows: &[ScaledBarRow]) -> Result<()> {
        self.merge_sync(m1_rows, d1_rows)
    }

    async fn ensure_staging_tables(&self) -> Result<()> {
        self.create_staging_tables_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticker: &str, ts: i64, o: i64, h: i64, l: i64, c: i64, v: i64) -> ScaledBarRow {
        ScaledBarRow {
            ticker: ticker.to_string(),
            volume: v,
            open: o,
            close: c,
            high: h,
            low: l,
            timestamp_ms: ts,
        }
    }

    fn minute_row_value(conn: &Connection, minute_ms: i64) -> (i64, i64, i64, i64, i64) {
        conn.query_row(
            r#"SELECT open, close, high, low, volume FROM ohlcv_1m WHERE ticker='AAPL' AND "timestamp"=?1"#,
            params![minute_ms],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn merges_three_bars_into_one_minute_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollups.db");
        let store = SqliteRollupStore::new(path.to_str().unwrap(), "w1").unwrap();

        let minute_base = 1_718_028_000_000_i64; // aligned to a minute boundary
        let rows = vec![
            row("AAPL", minute_base + 1_000, 190_000, 190_300, 189_950, 190_150, 100),
            row("AAPL", minute_base + 7_000, 190_200, 190_350, 190_150, 190_250, 200),
            row("AAPL", minute_base + 12_000, 190_100, 190_150, 190_000, 190_050, 300),
        ];

        store.merge_batch(&rows, &[]).await.unwrap();

        let (open, close, high, low, volume) = minute_row_value(&store.conn.lock(), minute_base);
        assert_eq!(open, 190_000);
        assert_eq!(close, 190_050);
        assert_eq!(high, 190_350);
        assert_eq!(low, 189_950);
        assert_eq!(volume, 600);
    }

    #[tokio::test]
    async fn replaying_same_batch_is_idempotent_except_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollups.db");
        let store = SqliteRollupStore::new(path.to_str().unwrap(), "w1").unwrap();

        let minute_base = 1_718_028_000_000_i64;
        let rows = vec![row("AAPL", minute_base + 1_000, 190_000, 190_300, 189_950, 190_150, 100)];

        store.merge_batch(&rows, &[]).await.unwrap();
        store.merge_batch(&rows, &[]).await.unwrap();

        let (open, close, high, low, volume) = minute_row_value(&store.conn.lock(), minute_base);
        assert_eq!((open, close, high, low), (190_000, 190_150, 190_300, 189_950));
        assert_eq!(volume, 200); // volume double-counts on replay, per spec
    }

    #[tokio::test]
    async fn open_is_preserved_once_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollups.db");
        let store = SqliteRollupStore::new(path.to_str().unwrap(), "w1").unwrap();

        let minute_base = 1_718_028_000_000_i64;
        store
            .merge_batch(&[row("AAPL", minute_base + 1_000, 190_000, 190_300, 189_950, 190_150, 100)], &[])
            .await
            .unwrap();
        // A later batch for the same minute with a different open must not
        // overwrite the existing open.
        store
            .merge_batch(&[row("AAPL", minute_base + 30_000, 999_000, 999_000, 999_000, 999_000, 1)], &[])
            .await
            .unwrap();

        let (open, _, _, _, _) = minute_row_value(&store.conn.lock(), minute_base);
        assert_eq!(open, 190_000);
    }
}
