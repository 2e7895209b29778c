//! Globals as composed state (Design Note, §9): the symbol index,
//! channel registry, aggregator, stale coalescer, per-symbol "next slow
//! dispatch" times, latest-price cache, and sec-filings snapshot bundled
//! into one value passed by reference instead of process-wide statics.
//! One live `Bus` per process is still the deployment model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::aggregator::AggregatorHandle;
use crate::channel_registry::ChannelRegistry;
use crate::collaborators::{AlertsSink, ChatHandler, HistoricalStore};
use crate::config::Config;
use crate::stale_coalescer::StaleCoalescerHandle;
use crate::symbol_index::SymbolIndex;

const SEC_FILINGS_CAPACITY: usize = 50;

pub struct Bus {
    pub symbol_index: Arc<SymbolIndex>,
    pub registry: Arc<ChannelRegistry>,
    pub aggregator: Arc<AggregatorHandle>,
    pub stale: Arc<StaleCoalescerHandle>,
    pub historical_store: Arc<dyn HistoricalStore>,
    pub chat_handler: Arc<dyn ChatHandler>,
    pub alerts: Arc<dyn AlertsSink>,
    pub filings_cache: Arc<RwLock<VecDeque<serde_json::Value>>>,
    /// Per-symbol (ticker string, per §9's documented asymmetry) wallclock
    /// of the next allowed "slow" channel emission.
    next_slow_dispatch_ms: Mutex<HashMap<String, i64>>,
    /// Latest trade price per security id, updated only when a trade's
    /// `should_update_price` is true (§4.9).
    latest_price: Mutex<HashMap<i64, f64>>,
    /// Monotonic max of every ingested event's primary timestamp (§4.9).
    last_tick_timestamp_ms: AtomicI64,
    pub config: Config,
}

impl Bus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        symbol_index: Arc<SymbolIndex>,
        aggregator: Arc<AggregatorHandle>,
        stale: Arc<StaleCoalescerHandle>,
        historical_store: Arc<dyn HistoricalStore>,
        chat_handler: Arc<dyn ChatHandler>,
        alerts: Arc<dyn AlertsSink>,
        evict: mpsc::UnboundedSender<crate::channel_registry::SessionId>,
    ) -> Self {
        Self {
            symbol_index,
            registry: Arc::new(ChannelRegistry::new(evict)),
            aggregator,
            stale,
            historical_store,
            chat_handler,
            alerts,
            filings_cache: Arc::new(RwLock::new(VecDeque::with_capacity(SEC_FILINGS_CAPACITY))),
            next_slow_dispatch_ms: Mutex::new(HashMap::new()),
            latest_price: Mutex::new(HashMap::new()),
            last_tick_timestamp_ms: AtomicI64::new(0),
            config,
        }
    }

    /// Advances the global last-tick timestamp to `ts` if it's newer,
    /// returning the (possibly unchanged) monotonic max.
    pub fn advance_last_tick_timestamp(&self, ts: i64) -> i64 {
        self.last_tick_timestamp_ms.fetch_max(ts, Ordering::AcqRel).max(ts)
    }

    pub fn last_tick_timestamp(&self) -> i64 {
        self.last_tick_timestamp_ms.load(Ordering::Acquire)
    }

    /// True, and advances the per-ticker deadline by 1s, iff `now_ms` has
    /// reached this ticker's next allowed slow-channel dispatch (§4.9).
    pub fn try_advance_slow_dispatch(&self, ticker: &str, now_ms: i64) -> bool {
        let mut map = self.next_slow_dispatch_ms.lock();
        let next_allowed = map.get(ticker).copied().unwrap_or(0);
        if now_ms < next_allowed {
            return false;
        }
        map.insert(ticker.to_string(), now_ms + 1_000);
        true
    }

    pub fn set_latest_price(&self, security_id: i64, price: f64) {
        self.latest_price.lock().insert(security_id, price);
    }

    pub fn latest_price(&self, security_id: i64) -> Option<f64> {
        self.latest_price.lock().get(&security_id).copied()
    }

    pub fn push_filing(&self, item: serde_json::Value) {
        let mut cache = self.filings_cache.write();
        if cache.len() >= SEC_FILINGS_CAPACITY {
            cache.pop_front();
        }
        cache.push_back(item);
    }
}
