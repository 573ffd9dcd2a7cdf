//! The Pub/Sub Publisher (spec §4.8): given a channel name and a payload,
//! enumerates subscribed FDs from the Subscriptions table and pushes a JSON
//! frame to each. Best-effort — a failed push (closed socket, backpressure)
//! is logged by [`ConnectionManager::push`] and never aborts the fan-out.

use serde_json::Value;

use crate::state::AppState;
use crate::websocket::events::{now_ts, ServerFrame};

/// Publish `payload` to every FD currently subscribed to `channel`. Returns
/// the number of FDs the fan-out was attempted against (not the number that
/// actually received it — that's inherently unobservable from here, per
/// spec §4.9 "silent drop with debug log").
pub fn publish(state: &AppState, channel: &str, payload: Value) -> usize {
    let fds = state.tables.subscriptions.fds_for_channel(channel);
    let frame = ServerFrame::Publish {
        channel: channel.to_string(),
        data: payload,
        timestamp: now_ts(),
    };
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!(channel, error = ?e, "failed to serialize publish frame");
            return 0;
        }
    };
    for fd in &fds {
        state.connections.push(*fd, json.clone());
    }
    fds.len()
}
