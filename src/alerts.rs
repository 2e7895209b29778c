//! Best-effort bridge to the external alerts component (§4.9). A real
//! deployment would swap this for a client of whatever alerting system is
//! in use (out of scope, §1); this implementation surfaces the same event
//! as a metric and a structured log line so the seam is exercised without
//! fabricating an external dependency.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::collaborators::AlertsSink;

pub struct MetricsAlertsSink;

#[async_trait]
impl AlertsSink for MetricsAlertsSink {
    async fn notify_bar_advanced(&self, ticker: &str, end_timestamp_ms: i64) -> Result<()> {
        metrics::counter!("ticker_bar_advanced_total").increment(1);
        info!(ticker, end_timestamp_ms, "ticker minute state advanced");
        Ok(())
    }
}
