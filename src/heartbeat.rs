//! Broadcast Timestamp (I, §4.10). A fixed-cadence task that pushes the
//! current wallclock to every connected session, independent of channel
//! subscription, so a client can detect a stalled connection even when
//! no trades are flowing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::channel_registry::ChannelRegistry;
use crate::wire::OutgoingFrame;

/// Spawns the heartbeat loop. The returned handle is aborted on shutdown;
/// there is no graceful drain since a heartbeat frame carries no state.
pub fn spawn(registry: Arc<ChannelRegistry>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let now_ms = now_millis();
            registry.broadcast_all(&OutgoingFrame::heartbeat(now_ms));
        }
    })
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
