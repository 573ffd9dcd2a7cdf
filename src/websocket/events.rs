//! Server → client WebSocket frame schema (spec §6). Every frame is a
//! single-line JSON object; `#[serde(tag = "type")]` gives us the exact
//! `{"type": "...", ...}` shape the spec's wire examples show without hand
//! writing serialization for each variant.
//!
//! Client → server frames are deliberately *not* modeled as a closed enum
//! here: the dispatch table (spec §4.1) routes on the raw `type` string and
//! falls through to the unified pipeline for anything it doesn't recognize
//! (including an absent `type` when `route`/`uri` is present), so
//! [`crate::websocket::handler`] works directly off `serde_json::Value`.

use serde::Serialize;
use serde_json::Value;

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Server → client frames (spec §6 "Server → client").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "system")]
    System {
        event: String,
        fd: u64,
        timestamp: i64,
    },
    #[serde(rename = "authenticated")]
    Authenticated {
        profile_id: i64,
        scope_entity_id: i64,
        timestamp: i64,
    },
    #[serde(rename = "subscribed")]
    Subscribed { channel: String, timestamp: i64 },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { channel: String, timestamp: i64 },
    #[serde(rename = "pong")]
    Pong { ts: Option<i64>, timestamp: i64 },
    #[serde(rename = "api_response")]
    ApiResponse {
        correlation_id: String,
        status: String,
        status_code: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: i64,
    },
    #[serde(rename = "api_error")]
    ApiError {
        correlation_id: String,
        status: String,
        status_code: u16,
        message: String,
        timestamp: i64,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        status_code: u16,
        message: String,
        timestamp: i64,
    },
    /// Pub/sub fan-out payload (spec §4.8). Not in the spec's literal frame
    /// table — that table only shows request/response shapes — but required
    /// for Testable Scenario (a), where a subscriber must actually receive
    /// a frame "containing `hello:world`".
    #[serde(rename = "publish")]
    Publish {
        channel: String,
        data: Value,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            event: None,
            status_code,
            message: message.into(),
            timestamp: now_ts(),
        }
    }

    pub fn device_mismatch() -> Self {
        ServerFrame::Error {
            event: Some("device_mismatch".to_string()),
            status_code: 400,
            message: "device fingerprint mismatch".to_string(),
            timestamp: now_ts(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerFrame serialization cannot fail")
    }
}
