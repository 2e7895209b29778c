//! Market-data fan-out and replay service: process entry point.
//!
//! Wires the composed `Bus` (symbol index, channel registry, aggregator,
//! stale coalescer, stores) to an axum WebSocket surface, spawns the
//! ingest pipeline and broadcast-timestamp heartbeat, and serves `/ws`
//! and `/health`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex as ParkingMutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marketdata_fanout::alerts::MetricsAlertsSink;
use marketdata_fanout::bus::Bus;
use marketdata_fanout::channel_registry::SessionId;
use marketdata_fanout::collaborators::{
    BaseDataType, ChatHandler, ChatQuery, HistoricalStore, HistoricalTick, UpstreamFeed,
};
use marketdata_fanout::config::{self, Config};
use marketdata_fanout::heartbeat;
use marketdata_fanout::ingest;
use marketdata_fanout::middleware::request_logging_simple;
use marketdata_fanout::replay;
use marketdata_fanout::session::Session;
use marketdata_fanout::stale_coalescer::StaleCoalescerHandle;
use marketdata_fanout::store::{SqliteRollupStore, SqliteStaleStore};
use marketdata_fanout::symbol_index::SymbolIndex;
use marketdata_fanout::wire::{OutgoingFrame, UpstreamEvent};

/// Placeholder for the real upstream market-data connection (out of
/// scope, §1). Reports a clean end-of-stream on the first poll so the
/// ingest pipeline exits instead of busy-looping against a feed that was
/// never wired up.
struct UnconfiguredUpstreamFeed;

#[async_trait::async_trait]
impl UpstreamFeed for UnconfiguredUpstreamFeed {
    async fn next_event(&mut self) -> Result<Option<UpstreamEvent>> {
        warn!("no upstream feed configured; ingest pipeline has nothing to consume");
        Ok(None)
    }
}

/// Placeholder historical store (out of scope, §1): answers every query
/// with "nothing on file" rather than fabricating data.
struct UnconfiguredHistoricalStore;

#[async_trait::async_trait]
impl HistoricalStore for UnconfiguredHistoricalStore {
    async fn range(
        &self,
        _security_id: i64,
        _base_type: BaseDataType,
        _after_ms: i64,
        _limit: usize,
    ) -> Result<Vec<HistoricalTick>> {
        Ok(Vec::new())
    }

    async fn point_in_time(
        &self,
        _security_id: i64,
        _base_type: BaseDataType,
        _at_ms: i64,
    ) -> Result<Option<HistoricalTick>> {
        Ok(None)
    }
}

/// Placeholder chat handler (out of scope, §1): reports that no backend
/// is wired up instead of pretending to answer.
struct UnconfiguredChatHandler;

#[async_trait::async_trait]
impl ChatHandler for UnconfiguredChatHandler {
    async fn handle(&self, query: ChatQuery) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "request_id": query.request_id,
            "message": "chat backend not configured",
        }))
    }
}

#[derive(Clone)]
struct AppState {
    bus: Arc<Bus>,
    sessions: Arc<ParkingMutex<HashMap<SessionId, Weak<Session>>>>,
    next_session_id: Arc<AtomicU64>,
    metrics_handle: PrometheusHandle,
}

/// CLI overrides layered over the env-var `Config`; flags take
/// precedence over the environment when both are set.
#[derive(Parser, Debug)]
#[command(name = "marketdata-fanout")]
struct Cli {
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    #[arg(long, env = "SYMBOL_TABLE_PATH")]
    symbol_table: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_env();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(symbol_table) = cli.symbol_table {
        config.symbol_table_path = symbol_table;
    }

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let symbol_index = Arc::new(
        SymbolIndex::load_from_csv(&config.symbol_table_path)
            .context("failed to load symbol table; ingest cannot start without it")?,
    );
    info!(symbols = symbol_index.len(), "symbol index loaded");

    let rollup_store = Arc::new(
        SqliteRollupStore::new(&config.rollup_db_path, "primary")
            .context("failed to open rollup store")?,
    );
    let stale_store = Arc::new(
        SqliteStaleStore::new(&config.stale_db_path).context("failed to open stale store")?,
    );

    let aggregator = Arc::new(marketdata_fanout::aggregator::AggregatorHandle::spawn(
        config.aggregator_flush_threshold,
        std::time::Duration::from_secs(config.aggregator_flush_timeout_secs),
        rollup_store,
    ));
    let stale = Arc::new(StaleCoalescerHandle::spawn(stale_store));

    let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
    let bus = Arc::new(Bus::new(
        config.clone(),
        symbol_index,
        aggregator.clone(),
        stale.clone(),
        Arc::new(UnconfiguredHistoricalStore),
        Arc::new(UnconfiguredChatHandler),
        Arc::new(MetricsAlertsSink),
        evict_tx,
    ));

    let sessions: Arc<ParkingMutex<HashMap<SessionId, Weak<Session>>>> =
        Arc::new(ParkingMutex::new(HashMap::new()));

    let eviction_sessions = sessions.clone();
    tokio::spawn(async move {
        while let Some(id) = evict_rx.recv().await {
            let session = eviction_sessions.lock().remove(&id).and_then(|w| w.upgrade());
            if let Some(session) = session {
                metrics::counter!("sessions_evicted_total").increment(1);
                info!(session_id = id, "evicting session with a stalled send queue");
                session.teardown();
            }
        }
    });

    let (ingest_stop_tx, ingest_stop_rx) = oneshot::channel();
    let ingest_bus = bus.clone();
    let ingest_task = tokio::spawn(ingest::run(Box::new(UnconfiguredUpstreamFeed), ingest_bus, ingest_stop_rx));

    let heartbeat_task = heartbeat::spawn(bus.registry.clone(), bus.config.heartbeat_interval_secs);

    let state = AppState {
        bus: bus.clone(),
        sessions,
        next_session_id: Arc::new(AtomicU64::new(1)),
        metrics_handle,
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging_simple))
        .with_state(state);

    let listener = TcpListener::bind(&bus.config.bind_addr).await?;
    info!(addr = %bus.config.bind_addr, "market-data fan-out service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = ingest_stop_tx.send(());
    heartbeat_task.abort();
    let _ = ingest_task.await;
    aggregator.stop().await;
    stale.stop();

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn health_check() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(state.bus.config.session_send_queue_capacity);

    let session = Session::new(
        id,
        state.bus.registry.clone(),
        state.bus.historical_store.clone(),
        state.bus.chat_handler.clone(),
        state.bus.filings_cache.clone(),
        tx,
    );
    state.sessions.lock().insert(id, Arc::downgrade(&session));

    let replay_task = replay::scheduler::spawn(
        &session,
        state.bus.config.replay_tick_interval_ms,
        state.bus.config.replay_buffer_lookahead_ms,
    );

    pump_socket(socket, &session, rx).await;

    replay_task.abort();
    session.teardown();
    state.sessions.lock().remove(&id);
}

async fn pump_socket(mut socket: WebSocket, session: &Arc<Session>, mut out_rx: mpsc::Receiver<OutgoingFrame>) {
    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_incoming_frame(text.as_bytes()).await,
                    Some(Ok(Message::Binary(bytes))) => session.handle_incoming_frame(&bytes).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
