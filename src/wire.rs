//! Session wire protocol (§6) — inbound client actions and outbound
//! frames, both JSON text over the session transport. Timestamps on the
//! wire are milliseconds since epoch throughout.

use serde::{Deserialize, Serialize};

/// Inbound frame from a client. Unknown/missing fields for a given
/// `action` are a client protocol error (§7 kind 4): the frame is
/// discarded, not rejected with an error response.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFrame {
    pub action: String,
    #[serde(rename = "channelName")]
    pub channel_name: Option<String>,
    pub timestamp: Option<i64>,
    pub speed: Option<f64>,
    #[serde(rename = "extendedHours")]
    pub extended_hours: Option<bool>,
    pub request_id: Option<String>,
    pub query: Option<String>,
    pub context: Option<serde_json::Value>,
    #[serde(rename = "activeChartContext")]
    pub active_chart_context: Option<serde_json::Value>,
    pub conversation_id: Option<String>,
}

/// An upstream aggregate (OHLCV) bar. Only bars whose
/// `end_timestamp_ms - start_timestamp_ms == 1000` are accepted by ingest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggPayload {
    pub ticker: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub start_timestamp_ms: i64,
    pub end_timestamp_ms: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    pub ticker: String,
    pub price: f64,
    pub size: i64,
    pub timestamp_ms: i64,
    pub exchange_id: i32,
    pub conditions: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteEvent {
    pub ticker: String,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: i32,
    pub ask_size: i32,
    pub timestamp_ms: i64,
}

/// Typed upstream event dispatched by the ingest pipeline (Design Note:
/// "Polymorphic upstream event" -> exhaustive tagged variant).
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Agg(AggPayload),
    Trade(TradeEvent),
    Quote(QuoteEvent),
}

/// Outgoing trade payload, as placed on "fast"/"all"/"slow" channels.
#[derive(Debug, Clone, Serialize)]
pub struct TradePayload {
    pub channel: String,
    pub price: f64,
    pub size: i64,
    pub timestamp_ms: i64,
    pub exchange_id: i32,
    pub conditions: Vec<i32>,
    #[serde(rename = "shouldUpdatePrice")]
    pub should_update_price: bool,
}

/// Outgoing quote payload, placed on the `<id>-quote` channel.
#[derive(Debug, Clone, Serialize)]
pub struct QuotePayload {
    pub channel: String,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: i32,
    pub ask_size: i32,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ChatResponse {
    #[serde(rename = "chat_response")]
    Chat {
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Outbound frame: any of these is serialized as one JSON object and
/// enqueued non-blockingly to a session's send queue.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingFrame {
    Trade(TradePayload),
    Quote(QuotePayload),
    Heartbeat { channel: &'static str, timestamp: i64 },
    Chat(ChatResponse),
    Raw(serde_json::Value),
}

impl OutgoingFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn heartbeat(timestamp: i64) -> Self {
        OutgoingFrame::Heartbeat {
            channel: "timestamp",
            timestamp,
        }
    }
}
