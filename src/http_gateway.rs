//! The HTTP Gateway (spec §4 component 8): one catch-all route under
//! `/api/*` that builds a [`RawRequest`] from the raw axum request and hands
//! it to the same [`pipeline::run`] the WebSocket `api` frame handler calls
//! — this is the "unified" in "Unified Request Pipeline". Lives in the
//! library (rather than inline in the binary) so integration tests can
//! mount the exact handler `main` serves, without re-wiring the pipeline
//! glue a second time.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, OriginalUri, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::AppError;
use crate::pipeline::{self, PipelineOutcome, RawRequest};
use crate::router::Transport;
use crate::state::AppState;

fn extract_meta_fingerprint(body: &serde_json::Value) -> Option<String> {
    body.get("meta")
        .and_then(|m| m.get("fingerprint"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub async fn http_gateway(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let body_json: serde_json::Value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => {
                return AppError::Input("request body is not valid JSON".into()).into_response();
            }
        }
    };

    let fingerprint = extract_meta_fingerprint(&body_json);

    let raw = RawRequest {
        method,
        uri: uri.to_string(),
        headers: header_map,
        body: body_json,
        explicit_query: HashMap::new(),
        remote_addr: addr.ip().to_string(),
        transport: Transport::Http,
        correlation_id: None,
        token_override: None,
        fingerprint,
        fd: None,
    };

    match pipeline::run(&state, raw).await {
        Ok(PipelineOutcome::Success { data, status_code }) => {
            let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
            (status, Json(data)).into_response()
        }
        Ok(PipelineOutcome::DeviceMismatch) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "event": "device_mismatch",
                "message": "device fingerprint mismatch",
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
