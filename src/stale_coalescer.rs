//! Stale-Ticker Coalescer (E, §4.8). Collects tickers flagged stale by
//! the ingest pipeline into a set, and on a fixed cadence drains the set
//! into one bulk `StaleSink::mark_stale()` call rather than writing one
//! row per tick. Mirrors the aggregator's timer-task shape (§4.7).

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::collaborators::StaleSink;

const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct StaleCoalescer {
    pending: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl StaleCoalescer {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Flags a ticker as stale. Idempotent: flagging the same ticker
    /// twice before the next flush collapses to one mark.
    pub fn flag(&self, ticker: &str) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.pending.lock().insert(ticker.to_string());
    }

    fn drain(&self) -> Vec<String> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Vec::new();
        }
        std::mem::take(&mut *pending).into_iter().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

pub struct StaleCoalescerHandle {
    pub coalescer: Arc<StaleCoalescer>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StaleCoalescerHandle {
    pub fn spawn(sink: Arc<dyn StaleSink>) -> Self {
        let coalescer = Arc::new(StaleCoalescer::new());

        let loop_coalescer = coalescer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                ticker.tick().await;
                if loop_coalescer.stopped.load(Ordering::Acquire) {
                    break;
                }
                let batch = loop_coalescer.drain();
                if batch.is_empty() {
                    continue;
                }
                let flush = tokio::time::timeout(FLUSH_TIMEOUT, sink.mark_stale(&batch)).await;
                match flush {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        metrics::counter!("stale_flush_errors_total").increment(1);
                        warn!("stale-mark flush failed, tickers dropped: {e}");
                    }
                    Err(_) => {
                        metrics::counter!("stale_flush_errors_total").increment(1);
                        warn!(
                            timeout_secs = FLUSH_TIMEOUT.as_secs(),
                            "stale-mark flush timed out, tickers dropped"
                        );
                    }
                }
            }
        });

        Self {
            coalescer,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn stop(&self) {
        if self.coalescer.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSink {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl StaleSink for RecordingSink {
        async fn mark_stale(&self, tickers: &[String]) -> anyhow::Result<()> {
            self.calls.lock().push(tickers.to_vec());
            Ok(())
        }
    }

    #[test]
    fn flagging_same_ticker_twice_collapses_to_one_entry() {
        let coalescer = StaleCoalescer::new();
        coalescer.flag("AAPL");
        coalescer.flag("AAPL");
        coalescer.flag("MSFT");
        assert_eq!(coalescer.pending_len(), 2);
    }

    #[tokio::test]
    async fn flush_drains_and_calls_sink_once() {
        let sink = Arc::new(RecordingSink {
            calls: Mutex::new(Vec::new()),
        });
        let handle = StaleCoalescerHandle::spawn(sink.clone());
        handle.coalescer.flag("AAPL");
        handle.coalescer.flag("MSFT");

        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        handle.stop();

        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }

    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StaleSink for FailingSink {
        async fn mark_stale(&self, _tickers: &[String]) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::AcqRel);
            anyhow::bail!("db unavailable")
        }
    }

    #[tokio::test]
    async fn sink_failure_is_swallowed_and_does_not_stop_the_loop() {
        let sink = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let handle = StaleCoalescerHandle::spawn(sink.clone());
        handle.coalescer.flag("AAPL");
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        handle.coalescer.flag("MSFT");
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
        handle.stop();

        assert_eq!(sink.attempts.load(Ordering::Acquire), 2);
    }
}
