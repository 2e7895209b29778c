use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::collaborators::RollupStore;
use crate::market_hours::is_regular_hours;

use super::buffer::AggregatorBufferEntry;
use super::{scale_price, ScaledBarRow};

/// The aggregator's single writer worker (§4.7). For each batch:
/// sort by (ticker, timestamp), project into M1 (all rows) and D1
/// (regular-hours rows only) with prices scaled to integer units, then
/// hand both to the rollup store in one merge call. A failed batch is
/// logged and the worker moves on to the next one -- data in that batch
/// is lost unless the upstream re-emits (§4.7 step 6).
pub async fn run_writer(
    mut batch_rx: mpsc::Receiver<Vec<AggregatorBufferEntry>>,
    rollup_store: Arc<dyn RollupStore>,
) {
    while let Some(mut batch) = batch_rx.recv().await {
        let start = Instant::now();
        let bar_count = batch.len();

        batch.sort_by(|a, b| {
            a.ticker
                .cmp(&b.ticker)
                .then_with(|| a.timestamp_ms.cmp(&b.timestamp_ms))
        });

        let m1_rows: Vec<ScaledBarRow> = batch.iter().map(project_row).collect();
        let d1_rows: Vec<ScaledBarRow> = batch
            .iter()
            .filter(|e| is_regular_hours(e.timestamp_ms))
            .map(project_row)
            .collect();

        match rollup_store.merge_batch(&m1_rows, &d1_rows).await {
            Ok(()) => {
                info!(
                    bar_count,
                    m1_rows = m1_rows.len(),
                    d1_rows = d1_rows.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "aggregator batch merged"
                );
            }
            Err(e) => {
                error!(
                    bar_count,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "aggregator batch merge failed, batch dropped: {e}"
                );
            }
        }
    }
}

fn project_row(e: &AggregatorBufferEntry) -> ScaledBarRow {
    ScaledBarRow {
        ticker: e.ticker.clone(),
        volume: e.volume,
        open: scale_price(e.open),
        close: scale_price(e.close),
        high: scale_price(e.high),
        low: scale_price(e.low),
        timestamp_ms: e.timestamp_ms,
    }
}
