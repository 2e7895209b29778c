//! End-to-end coverage across the composed `Bus`: a feed of upstream
//! events is pushed through the ingest pipeline and observed arriving at
//! a subscribed session's outbound queue, exercising the Symbol Index,
//! Condition Filter, Channel Registry, Session, Aggregator, and Stale
//! Coalescer together rather than in isolation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use marketdata_fanout::aggregator::AggregatorHandle;
use marketdata_fanout::alerts::MetricsAlertsSink;
use marketdata_fanout::bus::Bus;
use marketdata_fanout::collaborators::{BaseDataType, ChatHandler, ChatQuery, HistoricalStore, HistoricalTick, UpstreamFeed};
use marketdata_fanout::config::Config;
use marketdata_fanout::ingest;
use marketdata_fanout::session::Session;
use marketdata_fanout::stale_coalescer::StaleCoalescerHandle;
use marketdata_fanout::store::{SqliteRollupStore, SqliteStaleStore};
use marketdata_fanout::symbol_index::SymbolIndex;
use marketdata_fanout::wire::{OutgoingFrame, TradeEvent, UpstreamEvent};

struct NullHistorical;

#[async_trait]
impl HistoricalStore for NullHistorical {
    async fn range(&self, _id: i64, _t: BaseDataType, _after: i64, _limit: usize) -> anyhow::Result<Vec<HistoricalTick>> {
        Ok(Vec::new())
    }
    async fn point_in_time(&self, _id: i64, _t: BaseDataType, _at: i64) -> anyhow::Result<Option<HistoricalTick>> {
        Ok(None)
    }
}

struct NullChat;

#[async_trait]
impl ChatHandler for NullChat {
    async fn handle(&self, _query: ChatQuery) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

/// Replays a fixed queue of events once, then reports clean end-of-stream.
struct ScriptedFeed {
    events: Mutex<std::collections::VecDeque<UpstreamEvent>>,
}

impl ScriptedFeed {
    fn new(events: Vec<UpstreamEvent>) -> Self {
        Self {
            events: Mutex::new(events.into_iter().collect()),
        }
    }
}

#[async_trait]
impl UpstreamFeed for ScriptedFeed {
    async fn next_event(&mut self) -> anyhow::Result<Option<UpstreamEvent>> {
        Ok(self.events.lock().await.pop_front())
    }
}

/// A Monday 10:00:00 NY time regular-hours timestamp.
const REGULAR_HOURS_TS: i64 = 1_718_028_000_000;

async fn build_bus(dir: &tempfile::TempDir) -> Arc<Bus> {
    let config = Config::from_env();
    let symbol_index = Arc::new(SymbolIndex::load([("AAPL".to_string(), 7)]).unwrap());
    let rollup = Arc::new(
        SqliteRollupStore::new(dir.path().join("rollups.db").to_str().unwrap(), "w1").unwrap(),
    );
    let stale_store = Arc::new(SqliteStaleStore::new(dir.path().join("stale.db").to_str().unwrap()).unwrap());
    let aggregator = Arc::new(AggregatorHandle::spawn(7_500, Duration::from_secs(2), rollup));
    let stale = Arc::new(StaleCoalescerHandle::spawn(stale_store));
    let (evict_tx, _evict_rx) = mpsc::unbounded_channel();

    Arc::new(Bus::new(
        config,
        symbol_index,
        aggregator,
        stale,
        Arc::new(NullHistorical),
        Arc::new(NullChat),
        Arc::new(MetricsAlertsSink),
        evict_tx,
    ))
}

#[tokio::test]
async fn trade_for_subscribed_ticker_reaches_the_session_on_the_fast_channel() {
    let dir = tempfile::tempdir().unwrap();
    let bus = build_bus(&dir).await;

    let (tx, mut rx) = mpsc::channel(8);
    let session = Session::new(
        1,
        bus.registry.clone(),
        bus.historical_store.clone(),
        bus.chat_handler.clone(),
        bus.filings_cache.clone(),
        tx,
    );
    session.handle_incoming_frame(br#"{"action":"subscribe","channelName":"7-fast-regular"}"#).await;

    let feed = ScriptedFeed::new(vec![UpstreamEvent::Trade(TradeEvent {
        ticker: "AAPL".to_string(),
        price: 191.5,
        size: 100,
        timestamp_ms: REGULAR_HOURS_TS,
        exchange_id: 4,
        conditions: vec![],
    })]);
    let (_stop_tx, stop_rx) = oneshot::channel();
    ingest::run(Box::new(feed), bus.clone(), stop_rx).await;

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame did not arrive")
        .expect("channel closed");

    match frame {
        OutgoingFrame::Trade(payload) => {
            assert_eq!(payload.channel, "7-fast-regular");
            assert_eq!(payload.price, 191.5);
            assert_eq!(payload.size, 100);
            assert!(payload.should_update_price);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    assert_eq!(bus.latest_price(7), Some(191.5));

    session.teardown();
    bus.aggregator.stop().await;
    bus.stale.stop();
}

#[tokio::test]
async fn trade_with_no_subscriber_is_dropped_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let bus = build_bus(&dir).await;

    let feed = ScriptedFeed::new(vec![UpstreamEvent::Trade(TradeEvent {
        ticker: "AAPL".to_string(),
        price: 100.0,
        size: 10,
        timestamp_ms: REGULAR_HOURS_TS,
        exchange_id: 1,
        conditions: vec![],
    })]);
    let (_stop_tx, stop_rx) = oneshot::channel();
    ingest::run(Box::new(feed), bus.clone(), stop_rx).await;

    assert_eq!(bus.last_tick_timestamp(), REGULAR_HOURS_TS);
    bus.aggregator.stop().await;
    bus.stale.stop();
}

#[tokio::test]
async fn unknown_ticker_trade_never_reaches_a_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let bus = build_bus(&dir).await;

    let (tx, mut rx) = mpsc::channel(8);
    let session = Session::new(
        2,
        bus.registry.clone(),
        bus.historical_store.clone(),
        bus.chat_handler.clone(),
        bus.filings_cache.clone(),
        tx,
    );
    session.handle_incoming_frame(br#"{"action":"subscribe","channelName":"999-fast-regular"}"#).await;

    let feed = ScriptedFeed::new(vec![UpstreamEvent::Trade(TradeEvent {
        ticker: "ZZZZ".to_string(),
        price: 1.0,
        size: 1,
        timestamp_ms: REGULAR_HOURS_TS,
        exchange_id: 1,
        conditions: vec![],
    })]);
    let (_stop_tx, stop_rx) = oneshot::channel();
    ingest::run(Box::new(feed), bus.clone(), stop_rx).await;

    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    session.teardown();
    bus.aggregator.stop().await;
    bus.stale.stop();
}
