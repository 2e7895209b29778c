//! Channel Registry & Fan-out (§4.3) — the subscriber-set map plus
//! lock-free listener-count probes.
//!
//! Shared-state policy (§5): the map of sets lives behind a `parking_lot`
//! RW lock (short critical sections, never held across an `.await`,
//! mirroring this codebase's existing `RwLock<HashMap<..>>` caches);
//! counts are atomics updated *outside* that lock so a reader never
//! blocks on a writer just to check `has_listeners`.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::OutgoingFrame;

pub type SessionId = u64;

/// Deferred-eviction signal: when a broadcast finds a session's send
/// queue full, it must not tear the session down under the registry
/// lock (Design Note: "Non-blocking send with eviction"). It instead
/// pushes the id here; a separate task drains this and performs the
/// actual close + unsubscribe-everywhere.
pub type EvictionSender = mpsc::UnboundedSender<SessionId>;

struct Counts {
    by_channel: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl Counts {
    fn new() -> Self {
        Self {
            by_channel: RwLock::new(HashMap::new()),
        }
    }

    fn handle(&self, channel: &str) -> Arc<AtomicI64> {
        if let Some(c) = self.by_channel.read().get(channel) {
            return c.clone();
        }
        self.by_channel
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    fn get(&self, channel: &str) -> i64 {
        self.by_channel
            .read()
            .get(channel)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

pub struct ChannelRegistry {
    subscribers: RwLock<HashMap<String, HashSet<SessionId>>>,
    counts: Counts,
    senders: RwLock<HashMap<SessionId, mpsc::Sender<OutgoingFrame>>>,
    evict: EvictionSender,
}

impl ChannelRegistry {
    pub fn new(evict: EvictionSender) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counts: Counts::new(),
            senders: RwLock::new(HashMap::new()),
            evict,
        }
    }

    /// Registers a session's send queue so `broadcast` can reach it.
    /// Called once when a session is accepted; removed on teardown.
    pub fn register_session(&self, id: SessionId, sender: mpsc::Sender<OutgoingFrame>) {
        self.senders.write().insert(id, sender);
    }

    pub fn deregister_session(&self, id: SessionId) {
        self.senders.write().remove(&id);
    }

    /// Idempotent. Adds to the subscriber set and increments the count;
    /// a second `subscribe` for the same (session, channel) is a no-op
    /// on the counter (HashSet dedupes the membership side).
    pub fn subscribe(&self, id: SessionId, channel: &str) {
        let inserted = {
            let mut subs = self.subscribers.write();
            subs.entry(channel.to_string())
                .or_insert_with(HashSet::new)
                .insert(id)
        };
        if inserted {
            self.counts.handle(channel).fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Removes from the subscriber set, decrements the count, and
    /// reclaims the channel entry once its set is empty.
    pub fn unsubscribe(&self, id: SessionId, channel: &str) {
        let removed = {
            let mut subs = self.subscribers.write();
            let Some(set) = subs.get_mut(channel) else {
                return;
            };
            let removed = set.remove(&id);
            if set.is_empty() {
                subs.remove(channel);
            }
            removed
        };
        if removed {
            self.counts.handle(channel).fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Removes a session from every channel it is subscribed to (session
    /// teardown per §4.4's failure path).
    pub fn unsubscribe_all(&self, id: SessionId, channels: &HashSet<String>) {
        for ch in channels {
            self.unsubscribe(id, ch);
        }
    }

    /// Lock-free probe. May transiently read a nonzero count against an
    /// already-empty set during concurrent removal (§5); callers that
    /// need certainty should check `broadcast`'s own set-based iteration
    /// instead.
    pub fn has_listeners(&self, channel: &str) -> bool {
        self.counts.get(channel) > 0
    }

    pub fn listener_count(&self, channel: &str) -> i64 {
        self.counts.get(channel)
    }

    /// Pushes `frame` to every registered session, independent of channel
    /// subscription. Used by the broadcast-timestamp heartbeat (I), which
    /// reaches all sessions rather than a channel's subscriber set.
    pub fn broadcast_all(&self, frame: &OutgoingFrame) {
        let senders = self.senders.read();
        for (id, sender) in senders.iter() {
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session_id = id, "heartbeat send queue full, scheduling eviction");
                    let _ = self.evict.send(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let _ = self.evict.send(*id);
                }
            }
        }
    }

    /// Iterates the subscriber set under the shared lock and performs a
    /// non-blocking enqueue to each session's send queue. All successful
    /// enqueues happen before this call returns; a full queue schedules
    /// that session for eviction on a different task rather than closing
    /// it here (never do teardown work while holding the registry lock).
    pub fn broadcast(&self, channel: &str, frame: &OutgoingFrame) {
        let ids: Vec<SessionId> = match self.subscribers.read().get(channel) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };
        if ids.is_empty() {
            return;
        }

        let senders = self.senders.read();
        for id in ids {
            let Some(sender) = senders.get(&id) else {
                continue;
            };
            match sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session_id = id, channel, "send queue full, scheduling eviction");
                    if self.evict.send(id).is_err() {
                        warn!("eviction channel closed; session {id} leaked on full queue");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session already torn down from the read side; eviction
                    // is a no-op but keeps the channel draining uniformly.
                    let _ = self.evict.send(id);
                }
            }
        }
    }
}
