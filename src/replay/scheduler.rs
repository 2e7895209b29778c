//! Replay Scheduler (H, §4.5) — one periodic task per session, not a
//! thread per buffer (Design Note: "Replay scheduler loop"). The tick
//! itself lives on `Session::replay_tick`; this module just owns the
//! cadence and the task handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::session::Session;

/// Spawns the ~30ms-cadence tick loop for one session. The loop keeps
/// running even when the session is live or paused -- `replay_tick` is a
/// no-op in both cases -- and exits only when the session itself is
/// dropped (the `Weak` upgrade fails).
pub fn spawn(session: &Arc<Session>, tick_interval_ms: u64, lookahead_ms: i64) -> JoinHandle<()> {
    let weak = Arc::downgrade(session);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_interval_ms));
        loop {
            ticker.tick().await;
            let Some(session) = weak.upgrade() else {
                break;
            };
            session.replay_tick(lookahead_ms);
        }
    })
}
