//! The Connection Manager's WS entry point (spec §4.1): accepts the
//! handshake, validates Origin, runs the per-FD lifecycle (`onOpen` /
//! `onMessage` dispatch table / `onClose`), and is the one place a frame
//! either gets handled locally (auth/subscribe/unsubscribe/ping) or is
//! forwarded into the unified request pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::fd::Fd;
use crate::pipeline::{self, PipelineOutcome, RawRequest};
use crate::router::Transport;
use crate::state::AppState;

use super::events::{now_ts, ServerFrame};

/// Largest inbound WS frame accepted before JSON parsing is even attempted
/// (spec §6 Limits: "WebSocket frame ≤ 1 MiB").
const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let origin_ok = {
        let config = state.config.read().await;
        origin_allowed(origin.as_deref(), &config.allowed_origins)
    };

    let fd = state.fds.allocate();
    let remote_addr = addr.ip().to_string();

    ws.on_upgrade(move |socket| handle_socket(socket, fd, remote_addr, origin_ok, state))
}

/// Spec §4.1 `onOpen`: "if origin is not in the allow-list (unless absent,
/// i.e., non-browser client), close with a policy-violation code".
fn origin_allowed(origin: Option<&str>, allow_list: &[String]) -> bool {
    match origin {
        None => true,
        Some(_) if allow_list.is_empty() => true,
        Some(o) => allow_list.iter().any(|allowed| allowed == o),
    }
}

async fn handle_socket(socket: WebSocket, fd: Fd, remote_addr: String, origin_ok: bool, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    if !origin_ok {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: 1008, // policy violation
                reason: "origin not allowed".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.open(fd, remote_addr.clone(), tx);

    let connected = ServerFrame::System {
        event: "connected".to_string(),
        fd: fd.0,
        timestamp: now_ts(),
    };
    if sender.send(Message::Text(connected.to_json())).await.is_err() {
        state.connections.close(&state.tables, fd).await;
        return;
    }

    let auth_timeout_secs = state.config.read().await.auth_timeout_secs;
    let mut auth_timer = Box::pin(tokio::time::sleep(Duration::from_secs(auth_timeout_secs)));
    let mut auth_timer_fired = false;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            let frame = ServerFrame::error(400, "frame exceeds maximum size");
                            if sender.send(Message::Text(frame.to_json())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        match dispatch_frame(&state, fd, &remote_addr, &text).await {
                            FrameOutcome::Reply(frame) => {
                                if sender.send(Message::Text(frame.to_json())).await.is_err() {
                                    break;
                                }
                            }
                            FrameOutcome::ReplyThenClose(frame) => {
                                let _ = sender.send(Message::Text(frame.to_json())).await;
                                break;
                            }
                            FrameOutcome::NoReply => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong frames carry no protocol meaning here
                    Some(Err(e)) => {
                        tracing::debug!(fd = %fd, error = ?e, "websocket receive error");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut auth_timer, if !auth_timer_fired => {
                auth_timer_fired = true;
                if state.tables.auth.get(fd).is_none() {
                    let frame = ServerFrame::error(401, "authentication timeout");
                    let _ = sender.send(Message::Text(frame.to_json())).await;
                    break;
                }
            }
        }
    }

    state.connections.close(&state.tables, fd).await;
}

enum FrameOutcome {
    Reply(ServerFrame),
    ReplyThenClose(ServerFrame),
    NoReply,
}

/// Spec §4.1 dispatch table, in full: rate limit first, then route by
/// `type`, falling through to the unified pipeline for anything else (or an
/// absent `type` carrying `route`/`uri`).
async fn dispatch_frame(state: &AppState, fd: Fd, remote_addr: &str, raw: &str) -> FrameOutcome {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return FrameOutcome::Reply(ServerFrame::error(400, "malformed JSON")),
    };

    if !rate_limit_admit(state, fd).await {
        return FrameOutcome::Reply(ServerFrame::error(429, "rate limit exceeded"));
    }

    let type_field = value.get("type").and_then(Value::as_str);

    match type_field {
        Some("auth") => handle_auth(state, fd, remote_addr, &value).await,
        Some("subscribe") => handle_subscribe(state, fd, &value).await,
        Some("unsubscribe") => handle_unsubscribe(state, fd, &value).await,
        Some("ping") => handle_ping(&value),
        _ => {
            let has_route = value.get("route").is_some() || value.get("uri").is_some();
            if type_field.is_none() && !has_route {
                return FrameOutcome::Reply(ServerFrame::error(400, "missing 'type' field"));
            }
            handle_api(state, fd, remote_addr, &value).await
        }
    }
}

/// Token-bucket admission (spec §4.1): precedes *every* message, including
/// ones that will themselves turn out to be malformed.
async fn rate_limit_admit(state: &AppState, fd: Fd) -> bool {
    let config = state.config.read().await;
    let now = now_ts() as f64;
    state
        .tables
        .rate_limit
        .try_acquire(fd, now, config.rate_limit_per_sec, config.rate_limit_burst)
        .is_ok()
}

async fn handle_auth(state: &AppState, fd: Fd, remote_addr: &str, value: &Value) -> FrameOutcome {
    let Some(token) = value.get("token").and_then(Value::as_str) else {
        return FrameOutcome::Reply(ServerFrame::error(400, "missing 'token' field"));
    };

    let config = state.config.read().await;
    let now = chrono::Utc::now().timestamp();
    let claims = match crate::auth::verify(
        token,
        &config.jwt_secret,
        &config.jwt_xor_key,
        remote_addr,
        config.trust_proxy,
        now,
    ) {
        Ok(c) => c,
        Err(_) => {
            state.tables.auth.remove(fd);
            return FrameOutcome::Reply(ServerFrame::error(401, "invalid or expired token"));
        }
    };
    drop(config);

    let profile = match state.profiles.load(claims.account_id, claims.profile_id).await {
        Ok(p) => p,
        Err(_) => {
            state.tables.auth.remove(fd);
            return FrameOutcome::Reply(ServerFrame::error(401, "profile could not be loaded"));
        }
    };
    let scope_entity_id = crate::profile::coerce_scope(claims.scope_entity_id, &profile);

    let entry = crate::tables::AuthEntry {
        account_id: claims.account_id,
        profile_id: claims.profile_id,
        scope_entity_id,
        token: token.to_string(),
        device_hash: claims.device_hash.clone(),
    };
    if state.tables.auth.set(fd, entry).is_err() {
        return FrameOutcome::Reply(ServerFrame::error(503, "auth table is full"));
    }

    FrameOutcome::Reply(ServerFrame::Authenticated {
        profile_id: claims.profile_id,
        scope_entity_id,
        timestamp: now_ts(),
    })
}

fn valid_channel_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && !name.contains('\0')
}

async fn handle_subscribe(state: &AppState, fd: Fd, value: &Value) -> FrameOutcome {
    if state.tables.auth.get(fd).is_none() {
        return FrameOutcome::Reply(ServerFrame::error(401, "authentication required"));
    }
    let Some(channel) = value.get("channel").and_then(Value::as_str) else {
        return FrameOutcome::Reply(ServerFrame::error(400, "missing 'channel' field"));
    };
    if !valid_channel_name(channel) {
        return FrameOutcome::Reply(ServerFrame::error(400, "invalid channel name"));
    }
    match state.tables.subscriptions.insert(channel, fd) {
        Ok(()) => {
            state.connections.track_subscription(fd, channel.to_string()).await;
            FrameOutcome::Reply(ServerFrame::Subscribed {
                channel: channel.to_string(),
                timestamp: now_ts(),
            })
        }
        Err(_) => FrameOutcome::Reply(ServerFrame::error(503, "subscriptions table is full")),
    }
}

async fn handle_unsubscribe(state: &AppState, fd: Fd, value: &Value) -> FrameOutcome {
    let Some(channel) = value.get("channel").and_then(Value::as_str) else {
        return FrameOutcome::Reply(ServerFrame::error(400, "missing 'channel' field"));
    };
    state.tables.subscriptions.remove(channel, fd);
    state.connections.untrack_subscription(fd, channel).await;
    FrameOutcome::Reply(ServerFrame::Unsubscribed {
        channel: channel.to_string(),
        timestamp: now_ts(),
    })
}

fn handle_ping(value: &Value) -> FrameOutcome {
    let ts = value.get("ts").and_then(Value::as_i64);
    FrameOutcome::Reply(ServerFrame::Pong {
        ts,
        timestamp: now_ts(),
    })
}

async fn handle_api(state: &AppState, fd: Fd, remote_addr: &str, value: &Value) -> FrameOutcome {
    let uri = value
        .get("route")
        .or_else(|| value.get("uri"))
        .and_then(Value::as_str)
        .unwrap_or("/");

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .and_then(|m| m.parse::<Method>().ok())
        .unwrap_or(Method::GET);

    let body = value.get("body").cloned().unwrap_or(Value::Null);
    let explicit_query: HashMap<String, Value> = value
        .get("query")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let correlation_id = value
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let token_override = value.get("token").and_then(Value::as_str).map(str::to_string);
    let fingerprint = value
        .get("meta")
        .and_then(|m| m.get("fingerprint"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let raw = RawRequest {
        method,
        uri: uri.to_string(),
        headers: HashMap::new(),
        body,
        explicit_query,
        remote_addr: remote_addr.to_string(),
        transport: Transport::Ws,
        correlation_id: correlation_id.clone(),
        token_override,
        fingerprint,
        fd: Some(fd),
    };

    match pipeline::run(state, raw).await {
        Ok(PipelineOutcome::Success { data, status_code }) => {
            FrameOutcome::Reply(ServerFrame::ApiResponse {
                correlation_id: correlation_id.unwrap_or_default(),
                status: "success".to_string(),
                status_code,
                data: Some(data),
                message: None,
                timestamp: now_ts(),
            })
        }
        Ok(PipelineOutcome::DeviceMismatch) => {
            FrameOutcome::ReplyThenClose(ServerFrame::device_mismatch())
        }
        Err(AppError::Handler(_)) => FrameOutcome::Reply(ServerFrame::ApiError {
            correlation_id: correlation_id.unwrap_or_default(),
            status: "error".to_string(),
            status_code: 500,
            message: "Request failed. Check server logs for details.".to_string(),
            timestamp: now_ts(),
        }),
        Err(e) => FrameOutcome::Reply(ServerFrame::ApiError {
            correlation_id: correlation_id.unwrap_or_default(),
            status: "error".to_string(),
            status_code: e.status_code().as_u16(),
            message: e.public_message(),
            timestamp: now_ts(),
        }),
    }
}
