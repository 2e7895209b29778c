use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::collaborators::RollupStore;

use super::writer::run_writer;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorBufferEntry {
    pub ticker: String,
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// The shared buffer plus a bounded channel of batches consumed by a
/// single writer worker (§4.7). `add_bar` and the stale-flusher are the
/// only two producers of batches; both move the whole buffer out under
/// the mutex, reset it, and hand the batch to the channel non-blockingly.
pub struct Aggregator {
    buffer: Mutex<Vec<AggregatorBufferEntry>>,
    batch_tx: Mutex<Option<mpsc::Sender<Vec<AggregatorBufferEntry>>>>,
    last_flush_wallclock: Mutex<Instant>,
    flush_threshold: usize,
    dropped_batches: AtomicU64,
    stopped: AtomicBool,
}

/// Owns the aggregator plus its background tasks (writer, stale-flusher,
/// health checker, performance monitor) and exposes the idempotent
/// `stop()` that §4.7 requires.
pub struct AggregatorHandle {
    pub aggregator: Arc<Aggregator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    fn new(flush_threshold: usize, batch_tx: mpsc::Sender<Vec<AggregatorBufferEntry>>) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            batch_tx: Mutex::new(Some(batch_tx)),
            last_flush_wallclock: Mutex::new(Instant::now()),
            flush_threshold,
            dropped_batches: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// `add_bar(entry)` (§4.7): appends under the buffer mutex; once the
    /// buffer reaches `flush_threshold` the whole thing is taken out as a
    /// batch and handed to the channel non-blockingly. A full channel
    /// increments the drop counter and raises a critical alert rather than
    /// blocking the ingest pipeline that calls this.
    pub fn add_bar(&self, entry: AggregatorBufferEntry) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let batch = {
            let mut buf = self.buffer.lock();
            buf.push(entry);
            if buf.len() >= self.flush_threshold {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.flush_batch(batch);
        }
    }

    fn flush_batch(&self, batch: Vec<AggregatorBufferEntry>) {
        if batch.is_empty() {
            return;
        }
        *self.last_flush_wallclock.lock() = Instant::now();

        let sender = self.batch_tx.lock().clone();
        let Some(sender) = sender else { return };

        match sender.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                let total = self.dropped_batches.fetch_add(1, Ordering::AcqRel) + 1;
                metrics::counter!("aggregator_batches_dropped_total").increment(1);
                error!(
                    bars_dropped = dropped.len(),
                    drop_count = total,
                    "aggregator batch channel full; dropping batch (critical alert)"
                );
                if total.is_power_of_two() || total % 100 == 0 {
                    metrics::counter!("aggregator_drop_alerts_total").increment(1);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("aggregator batch channel closed; dropping batch during shutdown race");
            }
        }
    }

    /// Moves the buffer out if `now - last_flush_wallclock` exceeds
    /// `timeout`, even if the buffer hasn't hit `flush_threshold` yet
    /// (the stale-flusher, 1s cadence per §4.7).
    fn flush_if_stale(&self, timeout: Duration) {
        let should_flush = {
            let buf = self.buffer.lock();
            !buf.is_empty() && self.last_flush_wallclock.lock().elapsed() > timeout
        };
        if !should_flush {
            return;
        }
        let batch = std::mem::take(&mut *self.buffer.lock());
        self.flush_batch(batch);
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Acquire)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl AggregatorHandle {
    /// Spawns the writer worker plus the stale-flush/health-check/
    /// performance-monitor timers, and returns a handle bundling all of
    /// them with the aggregator itself.
    pub fn spawn(
        flush_threshold: usize,
        flush_timeout: Duration,
        rollup_store: Arc<dyn RollupStore>,
    ) -> Self {
        let (batch_tx, batch_rx) = mpsc::channel(64);
        let aggregator = Arc::new(Aggregator::new(flush_threshold, batch_tx));

        let writer = tokio::spawn(run_writer(batch_rx, rollup_store.clone()));

        let mut tasks = Vec::new();

        let stale_agg = aggregator.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if stale_agg.stopped.load(Ordering::Acquire) {
                    break;
                }
                stale_agg.flush_if_stale(flush_timeout);
            }
        }));

        let health_store = rollup_store.clone();
        let health_agg = aggregator.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if health_agg.stopped.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = health_store.ensure_staging_tables().await {
                    error!("staging table health check failed: {e}");
                }
            }
        }));

        let perf_agg = aggregator.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                if perf_agg.stopped.load(Ordering::Acquire) {
                    break;
                }
                let backlog = perf_agg.buffered_len();
                let dropped = perf_agg.dropped_batches();
                metrics::gauge!("aggregator_buffer_backlog").set(backlog as f64);
                info!(backlog, dropped, "aggregator performance snapshot");
            }
        }));

        Self {
            aggregator,
            tasks: Mutex::new(tasks),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Idempotent shutdown: stops accepting new bars, cancels the
    /// periodic tasks, flushes any remaining buffer, closes the batch
    /// channel, and waits for the writer to drain (§4.7).
    pub async fn stop(&self) {
        if self.aggregator.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let remaining = std::mem::take(&mut *self.aggregator.buffer.lock());
        if !remaining.is_empty() {
            if let Some(sender) = self.aggregator.batch_tx.lock().clone() {
                let _ = sender.send(remaining).await;
            }
        }

        // Drop the sender so the writer observes channel closure.
        self.aggregator.batch_tx.lock().take();

        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.await;
        }
    }
}
