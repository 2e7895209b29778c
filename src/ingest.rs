//! Ingest Pipeline (G, §4.9). One long-lived task consuming the typed
//! upstream stream and dispatching each event through the Symbol Index
//! (A), Condition Filter (B) and the Channel Registry (C), or into the
//! Aggregator (F) and Stale Coalescer (E) for 1-s aggregates.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::aggregator::AggregatorBufferEntry;
use crate::bus::Bus;
use crate::collaborators::UpstreamFeed;
use crate::condition_filter::{should_skip_ohlc, should_skip_volume};
use crate::market_hours::channel_name_type;
use crate::wire::{AggPayload, OutgoingFrame, QuoteEvent, QuotePayload, TradeEvent, TradePayload, UpstreamEvent};

/// Runs until the upstream feed reports clean end-of-stream or `stop_rx`
/// fires (§5 cancellation). A transient feed error is logged and the loop
/// continues (§7 error kind 1).
pub async fn run(mut feed: Box<dyn UpstreamFeed>, bus: Arc<Bus>, mut stop_rx: oneshot::Receiver<()>) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stop_rx => {
                debug!("ingest pipeline received stop signal");
                break;
            }
            event = feed.next_event() => event,
        };

        match event {
            Ok(Some(event)) => dispatch(&bus, event).await,
            Ok(None) => {
                debug!("upstream feed closed, ingest pipeline exiting");
                break;
            }
            Err(e) => warn!("upstream feed error, continuing: {e}"),
        }
    }
}

async fn dispatch(bus: &Arc<Bus>, event: UpstreamEvent) {
    match event {
        UpstreamEvent::Agg(agg) => dispatch_agg(bus, agg).await,
        UpstreamEvent::Trade(trade) => dispatch_trade(bus, trade),
        UpstreamEvent::Quote(quote) => dispatch_quote(bus, quote),
    }
}

async fn dispatch_agg(bus: &Arc<Bus>, agg: AggPayload) {
    bus.advance_last_tick_timestamp(agg.end_timestamp_ms);
    let (_id, found) = bus.symbol_index.resolve(&agg.ticker);
    if !found {
        return;
    }
    if agg.end_timestamp_ms - agg.start_timestamp_ms != 1000 {
        return; // wrong-duration bar (§7 kind 3, skip silently)
    }

    bus.aggregator.aggregator.add_bar(AggregatorBufferEntry {
        ticker: agg.ticker.clone(),
        timestamp_ms: agg.end_timestamp_ms,
        open: agg.open,
        high: agg.high,
        low: agg.low,
        close: agg.close,
        volume: agg.volume,
    });
    bus.stale.coalescer.flag(&agg.ticker);
    if let Err(e) = bus.alerts.notify_bar_advanced(&agg.ticker, agg.end_timestamp_ms).await {
        warn!("alerts notification failed: {e}");
    }
}

fn dispatch_trade(bus: &Arc<Bus>, trade: TradeEvent) {
    bus.advance_last_tick_timestamp(trade.timestamp_ms);
    let (security_id, found) = bus.symbol_index.resolve(&trade.ticker);
    if !found {
        return;
    }

    let skip_price = should_skip_ohlc(&trade.conditions);
    let skip_volume = should_skip_volume(&trade.conditions);
    let hours = channel_name_type(trade.timestamp_ms).as_str();

    let fast_channel = format!("{security_id}-fast-{hours}");
    let all_channel = format!("{security_id}-all");
    let slow_channel = format!("{security_id}-slow-{hours}");

    let registry = bus.registry.as_ref();
    if !registry.has_listeners(&fast_channel)
        && !registry.has_listeners(&all_channel)
        && !registry.has_listeners(&slow_channel)
    {
        return;
    }

    let size = if skip_volume { 0 } else { trade.size };
    let should_update_price = !skip_price;
    if should_update_price {
        bus.set_latest_price(security_id, trade.price);
    }

    let payload = |channel: String| TradePayload {
        channel,
        price: trade.price,
        size,
        timestamp_ms: trade.timestamp_ms,
        exchange_id: trade.exchange_id,
        conditions: trade.conditions.clone(),
        should_update_price,
    };

    registry.broadcast(&fast_channel, &OutgoingFrame::Trade(payload(fast_channel.clone())));
    registry.broadcast(&all_channel, &OutgoingFrame::Trade(payload(all_channel.clone())));

    if should_update_price && bus.try_advance_slow_dispatch(&trade.ticker, trade.timestamp_ms) {
        registry.broadcast(&slow_channel, &OutgoingFrame::Trade(payload(slow_channel.clone())));
    }
}

fn dispatch_quote(bus: &Arc<Bus>, quote: QuoteEvent) {
    bus.advance_last_tick_timestamp(quote.timestamp_ms);
    let (security_id, found) = bus.symbol_index.resolve(&quote.ticker);
    if !found {
        return;
    }
    let channel = format!("{security_id}-quote");
    if !bus.registry.has_listeners(&channel) {
        return;
    }
    bus.registry.broadcast(
        &channel,
        &OutgoingFrame::Quote(QuotePayload {
            channel: channel.clone(),
            bid_price: quote.bid_price,
            ask_price: quote.ask_price,
            bid_size: quote.bid_size,
            ask_size: quote.ask_size,
            timestamp_ms: quote.timestamp_ms,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AlertsSink, ChatHandler, ChatQuery, HistoricalStore};
    use crate::config::Config;
    use crate::store::{SqliteRollupStore, SqliteStaleStore};
    use crate::symbol_index::SymbolIndex;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NullHistorical;
    #[async_trait]
    impl HistoricalStore for NullHistorical {
        async fn range(
            &self,
            _s: i64,
            _b: crate::collaborators::BaseDataType,
            _a: i64,
            _l: usize,
        ) -> anyhow::Result<Vec<crate::collaborators::HistoricalTick>> {
            Ok(Vec::new())
        }
        async fn point_in_time(
            &self,
            _s: i64,
            _b: crate::collaborators::BaseDataType,
            _a: i64,
        ) -> anyhow::Result<Option<crate::collaborators::HistoricalTick>> {
            Ok(None)
        }
    }

    struct NullChat;
    #[async_trait]
    impl ChatHandler for NullChat {
        async fn handle(&self, _q: ChatQuery) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    struct CountingAlerts(AtomicUsize);
    #[async_trait]
    impl AlertsSink for CountingAlerts {
        async fn notify_bar_advanced(&self, _t: &str, _ts: i64) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn make_bus(dir: &tempfile::TempDir) -> Arc<Bus> {
        let config = Config::from_env();
        let symbol_index = Arc::new(SymbolIndex::load([("AAPL".to_string(), 7)]).unwrap());
        let rollup = Arc::new(SqliteRollupStore::new(dir.path().join("r.db").to_str().unwrap(), "w1").unwrap());
        let stale_store = Arc::new(SqliteStaleStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
        let aggregator = Arc::new(crate::aggregator::AggregatorHandle::spawn(7_500, Duration::from_secs(2), rollup));
        let stale = Arc::new(crate::stale_coalescer::StaleCoalescerHandle::spawn(stale_store));
        let (evict_tx, _evict_rx) = mpsc::unbounded_channel();
        Arc::new(Bus::new(
            config,
            symbol_index,
            aggregator,
            stale,
            Arc::new(NullHistorical),
            Arc::new(NullChat),
            Arc::new(CountingAlerts(AtomicUsize::new(0))),
            evict_tx,
        ))
    }

    #[tokio::test]
    async fn trade_reaches_sole_listener_on_fast_channel() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(&dir);
        let (tx, mut rx) = mpsc::channel(8);
        bus.registry.register_session(1, tx);
        bus.registry.subscribe(1, "7-fast-regular");

        dispatch_trade(
            &bus,
            TradeEvent {
                ticker: "AAPL".to_string(),
                price: 190.12,
                size: 100,
                timestamp_ms: 1_718_028_000_000, // 10:00 NY, regular hours
                exchange_id: 1,
                conditions: vec![],
            },
        );

        let frame = rx.try_recv().unwrap();
        match frame {
            OutgoingFrame::Trade(p) => {
                assert_eq!(p.channel, "7-fast-regular");
                assert_eq!(p.price, 190.12);
                assert_eq!(p.size, 100);
                assert!(p.should_update_price);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx.try_recv().is_err()); // "all" had no listener, nothing else queued

        bus.aggregator.stop().await;
        bus.stale.stop();
    }

    #[tokio::test]
    async fn condition_two_suppresses_price_update_and_slow_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(&dir);
        let (tx, mut rx) = mpsc::channel(8);
        bus.registry.register_session(1, tx);
        bus.registry.subscribe(1, "7-slow-regular");

        dispatch_trade(
            &bus,
            TradeEvent {
                ticker: "AAPL".to_string(),
                price: 190.12,
                size: 100,
                timestamp_ms: 1_718_028_000_000,
                exchange_id: 1,
                conditions: vec![2],
            },
        );

        assert!(rx.try_recv().is_err()); // should_update_price=false, slow not scheduled
        assert_eq!(bus.latest_price(7), None);

        bus.aggregator.stop().await;
        bus.stale.stop();
    }

    #[tokio::test]
    async fn unknown_ticker_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(&dir);
        dispatch_trade(
            &bus,
            TradeEvent {
                ticker: "ZZZZ".to_string(),
                price: 1.0,
                size: 1,
                timestamp_ms: 1_718_028_000_000,
                exchange_id: 1,
                conditions: vec![],
            },
        );
        bus.aggregator.stop().await;
        bus.stale.stop();
    }

    #[tokio::test]
    async fn wrong_duration_aggregate_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bus = make_bus(&dir);
        dispatch_agg(
            &bus,
            AggPayload {
                ticker: "AAPL".to_string(),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1,
                start_timestamp_ms: 0,
                end_timestamp_ms: 500,
            },
        )
        .await;
        assert_eq!(bus.aggregator.aggregator.buffered_len(), 0);
        bus.aggregator.stop().await;
        bus.stale.stop();
    }
}
