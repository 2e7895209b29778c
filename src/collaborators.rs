//! Trait seams for the external collaborators spec.md §1 calls out of
//! scope: the upstream feed client, the historical data store, the
//! transactional rollup store, and the stale-ticker sink. Each trait is
//! the interface the in-scope components (G, H, F, E) are written
//! against; concrete implementations live under `crate::store` (the
//! durable SQLite-backed ones) or are supplied by callers/tests (the
//! upstream feed and historical store, which this spec explicitly does
//! not implement).

use anyhow::Result;
use async_trait::async_trait;

use crate::wire::UpstreamEvent;

/// Delivers the interleaved upstream stream of `{Agg, Trade, Quote}`
/// events. The ingest pipeline (G) owns a `Box<dyn UpstreamFeed>` and
/// loops until `next_event` returns `Ok(None)` (clean end-of-stream) or
/// the pipeline's own stop signal fires.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>>;
}

/// A historical tick as replayed from the historical store: a trade, a
/// quote, or a previous-close pseudo-tick (Design Note: "TickData
/// variants"). Capability methods mirror what the replay scheduler (H)
/// needs to aggregate a batch without downcasting.
#[derive(Debug, Clone)]
pub enum HistoricalTick {
    Trade(crate::wire::TradeEvent),
    Quote(crate::wire::QuoteEvent),
    PrevClose { ticker: String, price: f64, timestamp_ms: i64 },
}

impl HistoricalTick {
    pub fn timestamp_ms(&self) -> i64 {
        match self {
            HistoricalTick::Trade(t) => t.timestamp_ms,
            HistoricalTick::Quote(q) => q.timestamp_ms,
            HistoricalTick::PrevClose { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn price(&self) -> Option<f64> {
        match self {
            HistoricalTick::Trade(t) => Some(t.price),
            HistoricalTick::Quote(_) => None,
            HistoricalTick::PrevClose { price, .. } => Some(*price),
        }
    }
}

/// Identifies which base-data-type a replay buffer drains (§3: per
/// (security, base-data-type) ReplayBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseDataType {
    Trade,
    Quote,
}

/// Range and point-in-time queries against historical trades/quotes.
/// `prefetch` asks for up to `limit` ticks strictly after `after_ms`;
/// `point_in_time` answers the subscription-time seed query (§4.6).
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    async fn range(
        &self,
        security_id: i64,
        base_type: BaseDataType,
        after_ms: i64,
        limit: usize,
    ) -> Result<Vec<HistoricalTick>>;

    async fn point_in_time(
        &self,
        security_id: i64,
        base_type: BaseDataType,
        at_ms: i64,
    ) -> Result<Option<HistoricalTick>>;
}

/// Accepts a sorted, scaled batch of bar rows and performs the
/// idempotent upsert-with-window-aggregation merge (§6) into the 1-minute
/// and 1-day rollups. Implemented by `crate::store::sqlite_rollup`.
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// `m1_rows` is every bar in the batch (projected into the 1-minute
    /// staging table); `d1_rows` is the subset falling in regular trading
    /// hours (projected into the 1-day staging table). Both merges run in
    /// one transaction per §4.7 step 3-6.
    async fn merge_batch(
        &self,
        m1_rows: &[crate::aggregator::ScaledBarRow],
        d1_rows: &[crate::aggregator::ScaledBarRow],
    ) -> Result<()>;

    /// Health check / recreate staging tables (§4.7 health checker).
    async fn ensure_staging_tables(&self) -> Result<()>;
}

/// Bulk upsert sink for the stale-ticker coalescer (E). Errors are
/// swallowed by the caller per §4.8 -- this trait just reports them.
#[async_trait]
pub trait StaleSink: Send + Sync {
    async fn mark_stale(&self, tickers: &[String]) -> Result<()>;
}

/// A `chat_query` request as decoded off the wire (§4.4, §6).
#[derive(Debug, Clone)]
pub struct ChatQuery {
    pub request_id: String,
    pub query: String,
    pub context: Option<serde_json::Value>,
    pub active_chart_context: Option<serde_json::Value>,
    pub conversation_id: Option<String>,
}

/// The external chat handler a session delegates `chat_query` to. A
/// handler error (or panic caught by the caller) becomes a
/// `chat_response` with `success=false`, not a torn-down session (§7
/// error kind 6).
#[async_trait]
pub trait ChatHandler: Send + Sync {
    async fn handle(&self, query: ChatQuery) -> Result<serde_json::Value>;
}

/// External "alerts" notification that a ticker's minute state advanced,
/// fired once per ingested 1-s aggregate alongside the stale-mark (§4.9,
/// Open Question: the two sinks are independent best-effort side effects).
#[async_trait]
pub trait AlertsSink: Send + Sync {
    async fn notify_bar_advanced(&self, ticker: &str, end_timestamp_ms: i64) -> Result<()>;
}
