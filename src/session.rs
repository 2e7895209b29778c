//! Session (D, §4.4) — per-client subscription state, live/replay mode
//! switching, and the incoming-frame dispatcher.
//!
//! Mutable state (replay clock, subscribed set, buffers) lives behind
//! plain `parking_lot::Mutex` guards, each held only long enough to read
//! or mutate a field -- never across a `.await` or a send (§5).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel_registry::{ChannelRegistry, SessionId};
use crate::collaborators::{BaseDataType, ChatHandler, ChatQuery, HistoricalStore, HistoricalTick};
use crate::replay::buffer::{aggregate_quotes, aggregate_trades, ReplayBuffer};
use crate::wire::{ChatResponse, IncomingFrame, OutgoingFrame, QuoteEvent, TradeEvent};

/// Replay-mode fields (§3). `speed` defaults to 1.0 and `extended_hours`
/// to false until the client sets them via `speed`/`setExtended`.
struct ReplayState {
    active: bool,
    paused: bool,
    speed: f64,
    extended_hours: bool,
    sim_time_ms: i64,
    sim_time_start_ms: i64,
    accumulated_active_duration_ms: i64,
    last_tick_wallclock: Instant,
    last_heartbeat_wallclock: Instant,
    last_slow_emit_wallclock: Instant,
    pre_replay_channels: HashSet<String>,
}

impl Default for ReplayState {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            active: false,
            paused: false,
            speed: 1.0,
            extended_hours: false,
            sim_time_ms: 0,
            sim_time_start_ms: 0,
            accumulated_active_duration_ms: 0,
            last_tick_wallclock: now,
            last_heartbeat_wallclock: now,
            last_slow_emit_wallclock: now - Duration::from_secs(1),
            pre_replay_channels: HashSet::new(),
        }
    }
}

pub struct Session {
    pub id: SessionId,
    registry: Arc<ChannelRegistry>,
    historical: Arc<dyn HistoricalStore>,
    chat_handler: Arc<dyn ChatHandler>,
    filings_cache: Arc<RwLock<VecDeque<serde_json::Value>>>,
    sender: mpsc::Sender<OutgoingFrame>,
    live_channels: Mutex<HashSet<String>>,
    replay: Mutex<ReplayState>,
    buffers: Mutex<HashMap<(i64, BaseDataType), ReplayBuffer>>,
}

/// Splits a channel name of the form `<id>-<suffix>` into its numeric
/// security id and type suffix. Non-numeric-prefixed names (`sec-filings`,
/// `timestamp`) are handled by dedicated actions, not this grammar.
fn parse_channel(channel: &str) -> Option<(i64, String)> {
    let (id_part, suffix) = channel.split_once('-')?;
    let security_id: i64 = id_part.parse().ok()?;
    Some((security_id, suffix.to_string()))
}

impl Session {
    pub fn new(
        id: SessionId,
        registry: Arc<ChannelRegistry>,
        historical: Arc<dyn HistoricalStore>,
        chat_handler: Arc<dyn ChatHandler>,
        filings_cache: Arc<RwLock<VecDeque<serde_json::Value>>>,
        sender: mpsc::Sender<OutgoingFrame>,
    ) -> Arc<Self> {
        registry.register_session(id, sender.clone());
        Arc::new(Self {
            id,
            registry,
            historical,
            chat_handler,
            filings_cache,
            sender,
            live_channels: Mutex::new(HashSet::new()),
            replay: Mutex::new(ReplayState::default()),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    fn send(&self, frame: OutgoingFrame) {
        // A full or closed queue here means the send pump (or the
        // registry's eviction path) is already tearing this session down;
        // there's nothing more for us to do (§4.4 "Internal: send").
        let _ = self.sender.try_send(frame);
    }

    pub async fn handle_incoming_frame(self: &Arc<Self>, bytes: &[u8]) {
        let frame: IncomingFrame = match serde_json::from_slice(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!(session_id = self.id, "discarding undecodable frame: {e}");
                return;
            }
        };

        match frame.action.as_str() {
            "subscribe" => {
                if let Some(ch) = frame.channel_name {
                    self.subscribe(&ch).await;
                }
            }
            "unsubscribe" => {
                if let Some(ch) = frame.channel_name {
                    self.unsubscribe(&ch).await;
                }
            }
            "subscribe-sec-filings" => self.subscribe_sec_filings(),
            "unsubscribe-sec-filings" => self.unsubscribe_sec_filings(),
            "replay" => {
                if !self.replay.lock().active {
                    if let Some(ts) = frame.timestamp {
                        self.start_replay(ts).await;
                    }
                }
            }
            "realtime" => self.stop_replay(),
            "pause" => self.replay.lock().paused = true,
            "play" => {
                let mut r = self.replay.lock();
                r.paused = false;
                r.last_tick_wallclock = Instant::now();
            }
            "speed" => {
                if let Some(s) = frame.speed {
                    if s.is_finite() && s > 0.0 {
                        self.replay.lock().speed = s;
                    }
                }
            }
            "setExtended" => {
                if let Some(eh) = frame.extended_hours {
                    self.replay.lock().extended_hours = eh;
                }
            }
            "nextOpen" => self.jump_to_next_open(),
            "chat_query" => self.spawn_chat_query(frame),
            other => debug!(session_id = self.id, action = other, "unknown action, discarding frame"),
        }
    }

    async fn subscribe(self: &Arc<Self>, channel: &str) {
        if channel == "sec-filings" {
            self.subscribe_sec_filings();
            return;
        }
        let is_replay = self.replay.lock().active;
        if !is_replay {
            self.registry.subscribe(self.id, channel);
            self.live_channels.lock().insert(channel.to_string());
            return;
        }
        self.replay_subscribe(channel).await;
    }

    async fn unsubscribe(self: &Arc<Self>, channel: &str) {
        if channel == "sec-filings" {
            self.unsubscribe_sec_filings();
            return;
        }
        let is_replay = self.replay.lock().active;
        if !is_replay {
            self.registry.unsubscribe(self.id, channel);
            self.live_channels.lock().remove(channel);
            return;
        }
        self.replay_unsubscribe(channel);
    }

    fn subscribe_sec_filings(&self) {
        self.registry.subscribe(self.id, "sec-filings");
        self.live_channels.lock().insert("sec-filings".to_string());
        let snapshot: Vec<serde_json::Value> = self.filings_cache.read().iter().cloned().collect();
        for item in snapshot {
            self.send(OutgoingFrame::Raw(item));
        }
    }

    fn unsubscribe_sec_filings(&self) {
        self.registry.unsubscribe(self.id, "sec-filings");
        self.live_channels.lock().remove("sec-filings");
    }

    async fn replay_subscribe(self: &Arc<Self>, channel: &str) {
        let Some((security_id, suffix)) = parse_channel(channel) else {
            return;
        };
        let base_type = if suffix == "quote" { BaseDataType::Quote } else { BaseDataType::Trade };
        let sim_time = self.replay.lock().sim_time_ms;

        let seed = self.historical.point_in_time(security_id, base_type, sim_time).await;

        {
            let mut buffers = self.buffers.lock();
            let buf = buffers
                .entry((security_id, base_type))
                .or_insert_with(|| ReplayBuffer::new(security_id, base_type));
            if !buf.channel_types.iter().any(|c| c == &suffix) {
                buf.channel_types.push(suffix.clone());
            }
        }

        if let Ok(Some(tick)) = seed {
            self.emit_tick_on_channel(security_id, &suffix, tick);
        }
    }

    fn replay_unsubscribe(&self, channel: &str) {
        let Some((security_id, suffix)) = parse_channel(channel) else {
            return;
        };
        let base_type = if suffix == "quote" { BaseDataType::Quote } else { BaseDataType::Trade };
        let mut buffers = self.buffers.lock();
        if let Some(buf) = buffers.get_mut(&(security_id, base_type)) {
            buf.channel_types.retain(|c| c != &suffix);
            if buf.channel_types.is_empty() {
                buffers.remove(&(security_id, base_type));
            }
        }
    }

    fn emit_tick_on_channel(&self, security_id: i64, suffix: &str, tick: HistoricalTick) {
        let channel = format!("{security_id}-{suffix}");
        match tick {
            HistoricalTick::Trade(t) => self.send(OutgoingFrame::Trade(crate::wire::TradePayload {
                channel,
                price: t.price,
                size: t.size,
                timestamp_ms: t.timestamp_ms,
                exchange_id: t.exchange_id,
                conditions: t.conditions,
                should_update_price: true,
            })),
            HistoricalTick::Quote(q) => self.send(OutgoingFrame::Quote(crate::wire::QuotePayload {
                channel,
                bid_price: q.bid_price,
                ask_price: q.ask_price,
                bid_size: q.bid_size,
                ask_size: q.ask_size,
                timestamp_ms: q.timestamp_ms,
            })),
            HistoricalTick::PrevClose { price, timestamp_ms, .. } => {
                self.send(OutgoingFrame::Raw(serde_json::json!({
                    "channel": channel,
                    "price": price,
                    "timestamp": timestamp_ms,
                })));
            }
        }
    }

    /// live -> replay (§4.4 state machine): unsubscribe every live channel,
    /// anchor the virtual clock, and replay-subscribe to each channel's
    /// replay equivalent so the same set re-activates on `realtime`.
    async fn start_replay(self: &Arc<Self>, anchor_ms: i64) {
        let prior_channels: Vec<String> = self.live_channels.lock().drain().collect();
        for ch in &prior_channels {
            self.registry.unsubscribe(self.id, ch);
        }

        {
            let mut r = self.replay.lock();
            r.active = true;
            r.paused = false;
            r.sim_time_start_ms = anchor_ms;
            r.sim_time_ms = anchor_ms;
            r.accumulated_active_duration_ms = 0;
            r.last_tick_wallclock = Instant::now();
            r.last_heartbeat_wallclock = Instant::now();
            r.last_slow_emit_wallclock = Instant::now() - Duration::from_secs(1);
            r.pre_replay_channels = prior_channels.iter().cloned().collect();
        }

        for ch in &prior_channels {
            self.replay_subscribe(ch).await;
        }
    }

    /// replay -> live: clear every buffer and restore exactly the channel
    /// set held before `replay` was issued (§8 round-trip property).
    fn stop_replay(self: &Arc<Self>) {
        let restore: Vec<String> = {
            let mut r = self.replay.lock();
            if !r.active {
                return;
            }
            r.active = false;
            std::mem::take(&mut r.pre_replay_channels).into_iter().collect()
        };
        self.buffers.lock().clear();
        let mut live = self.live_channels.lock();
        for ch in restore {
            self.registry.subscribe(self.id, &ch);
            live.insert(ch);
        }
    }

    fn jump_to_next_open(&self) {
        let mut r = self.replay.lock();
        let next = crate::market_hours::next_market_open(r.sim_time_ms, r.extended_hours);
        r.sim_time_ms = next;
        r.sim_time_start_ms = next;
        r.accumulated_active_duration_ms = 0;
        r.last_tick_wallclock = Instant::now();
    }

    fn spawn_chat_query(self: &Arc<Self>, frame: IncomingFrame) {
        let (Some(request_id), Some(query)) = (frame.request_id.clone(), frame.query.clone()) else {
            return;
        };
        let chat_query = ChatQuery {
            request_id: request_id.clone(),
            query,
            context: frame.context,
            active_chart_context: frame.active_chart_context,
            conversation_id: frame.conversation_id,
        };
        let session = self.clone();
        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(Duration::from_secs(600), session.chat_handler.handle(chat_query)).await;
            let response = match outcome {
                Ok(Ok(data)) => ChatResponse::Chat {
                    request_id,
                    success: true,
                    data: Some(data),
                    error: None,
                },
                Ok(Err(e)) => ChatResponse::Chat {
                    request_id,
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                },
                Err(_) => ChatResponse::Chat {
                    request_id,
                    success: false,
                    data: None,
                    error: Some("chat request timed out".to_string()),
                },
            };
            session.send(OutgoingFrame::Chat(response));
        });
    }

    /// Read-side transport failure (§4.4 Failure): close the send queue,
    /// unsubscribe from everything, and drop replay state.
    pub fn teardown(&self) {
        let channels = self.live_channels.lock().clone();
        self.registry.unsubscribe_all(self.id, &channels);
        self.registry.deregister_session(self.id);
        self.buffers.lock().clear();
    }

    /// One replay-scheduler tick (§4.5). No-op outside replay mode or
    /// while paused.
    pub fn replay_tick(self: &Arc<Self>, lookahead_ms: i64) {
        let (sim_time, do_heartbeat) = {
            let mut r = self.replay.lock();
            if !r.active || r.paused {
                return;
            }
            let now = Instant::now();
            let delta_ms = now.duration_since(r.last_tick_wallclock).as_millis() as i64;
            r.accumulated_active_duration_ms += delta_ms;
            r.last_tick_wallclock = now;
            r.sim_time_ms = r.sim_time_start_ms + ((r.accumulated_active_duration_ms as f64) * r.speed) as i64;

            if !crate::market_hours::is_in_session(r.sim_time_ms, r.extended_hours) {
                let next = crate::market_hours::next_market_open(r.sim_time_ms, r.extended_hours);
                r.sim_time_ms = next;
                r.sim_time_start_ms = next;
                r.accumulated_active_duration_ms = 0;
            }

            let heartbeat_due = now.duration_since(r.last_heartbeat_wallclock) >= Duration::from_secs(2);
            if heartbeat_due {
                r.last_heartbeat_wallclock = now;
            }
            (r.sim_time_ms, heartbeat_due)
        };

        if do_heartbeat {
            self.send(OutgoingFrame::heartbeat(sim_time));
        }
        self.drain_buffers(sim_time, lookahead_ms);
    }

    fn drain_buffers(self: &Arc<Self>, sim_time: i64, lookahead_ms: i64) {
        let mut refill_targets: Vec<(i64, BaseDataType, i64)> = Vec::new();

        {
            let mut buffers = self.buffers.lock();
            for ((security_id, base_type), buf) in buffers.iter_mut() {
                let drained = buf.drain_due(sim_time);
                if !drained.is_empty() {
                    emit_drained(self, *security_id, buf, &drained);
                }
                let needs_refill = match buf.lookahead_ms(sim_time) {
                    Some(remaining) => remaining < lookahead_ms,
                    None => true,
                };
                if needs_refill && !buf.refilling {
                    buf.refilling = true;
                    let after_ms = buf.queue.back().map(|t| t.timestamp_ms()).unwrap_or(sim_time);
                    refill_targets.push((*security_id, *base_type, after_ms));
                }
            }
        }

        for (security_id, base_type, after_ms) in refill_targets {
            self.spawn_prefetch(security_id, base_type, after_ms);
        }
    }

    fn spawn_prefetch(self: &Arc<Self>, security_id: i64, base_type: BaseDataType, after_ms: i64) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = session.historical.range(security_id, base_type, after_ms, 30_000).await;
            let mut buffers = session.buffers.lock();
            if let Some(buf) = buffers.get_mut(&(security_id, base_type)) {
                match result {
                    Ok(ticks) => buf.extend_ascending(ticks),
                    Err(e) => warn!(security_id, "replay prefetch failed: {e}"),
                }
                buf.refilling = false;
            }
        });
    }

    fn emit_aggregated(&self, suffix: &str, drained: &[HistoricalTick], channel: &str) {
        if suffix == "quote" {
            let quotes: Vec<QuoteEvent> = drained
                .iter()
                .filter_map(|t| match t {
                    HistoricalTick::Quote(q) => Some(q.clone()),
                    _ => None,
                })
                .collect();
            if let Some(payload) = (!quotes.is_empty()).then(|| aggregate_quotes(&quotes, channel)).flatten() {
                self.send(OutgoingFrame::Quote(payload));
            }
            return;
        }
        let trades: Vec<TradeEvent> = drained
            .iter()
            .filter_map(|t| match t {
                HistoricalTick::Trade(tr) => Some(tr.clone()),
                _ => None,
            })
            .collect();
        if let Some(payload) = (!trades.is_empty()).then(|| aggregate_trades(&trades, channel)).flatten() {
            self.send(OutgoingFrame::Trade(payload));
        }
    }

    fn slow_emit_allowed(&self) -> bool {
        let mut r = self.replay.lock();
        let now = Instant::now();
        if now.duration_since(r.last_slow_emit_wallclock) >= Duration::from_secs(1) {
            r.last_slow_emit_wallclock = now;
            true
        } else {
            false
        }
    }
}

fn emit_drained(session: &Arc<Session>, security_id: i64, buf: &ReplayBuffer, drained: &[HistoricalTick]) {
    for suffix in buf.channel_types.clone() {
        let channel = format!("{security_id}-{suffix}");
        match suffix.as_str() {
            "all" | "close" => {
                for tick in drained {
                    session.emit_tick_on_channel(security_id, &suffix, tick.clone());
                }
            }
            "fast-regular" | "fast-extended" | "quote" => {
                session.emit_aggregated(&suffix, drained, &channel);
            }
            "slow-regular" | "slow-extended" => {
                if session.slow_emit_allowed() {
                    session.emit_aggregated(&suffix, drained, &channel);
                }
            }
            _ => {}
        }
    }
}
