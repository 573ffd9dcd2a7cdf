//! The Connection Manager (spec §4.1): accepts WebSocket handshakes, owns
//! the per-FD lifecycle, and is the only writer of AuthEntry/RateBucket/
//! Subscription rows for FDs it owns (spec §5 "Shared-resource policy").
//!
//! The per-FD reverse index (`ConnectionRecord::channels`) is what makes
//! `close` O(channels-of-FD) instead of O(total-subscriptions) — the spec's
//! "Cyclic references" design note calls this out explicitly: the FD owns
//! both the reverse index and the Subscriptions rows, and destroys both on
//! close.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::fd::Fd;
use crate::task_pool::TaskCompletion;
use crate::tables::SharedTables;

struct ConnectionRecord {
    remote_addr: String,
    sender: mpsc::UnboundedSender<String>,
    /// Every channel this FD has subscribed to, so `close` can purge
    /// exactly those Subscription rows without scanning the whole table.
    channels: Mutex<HashSet<String>>,
}

/// Tracks open WebSocket connections keyed by [`Fd`]. Cheaply cloneable —
/// clones share the same underlying map via `Arc`.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<DashMap<Fd, Arc<ConnectionRecord>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `onOpen` bookkeeping (spec §4.1): register the FD's outbound sender.
    /// The caller (the WS upgrade handler) is responsible for the
    /// origin-allow-list check and the `system.connected` frame — this only
    /// tracks the connection so it can be pushed to and cleaned up later.
    pub fn open(&self, fd: Fd, remote_addr: String, sender: mpsc::UnboundedSender<String>) {
        self.connections.insert(
            fd,
            Arc::new(ConnectionRecord {
                remote_addr,
                sender,
                channels: Mutex::new(HashSet::new()),
            }),
        );
    }

    /// `onClose` (spec §4.1): O(1) cleanup via the per-FD reverse index,
    /// never a scan of the whole Subscriptions table.
    pub async fn close(&self, tables: &SharedTables, fd: Fd) {
        if let Some((_, record)) = self.connections.remove(&fd) {
            let channels: Vec<String> = record.channels.lock().await.iter().cloned().collect();
            tables.subscriptions.remove_fd_from(&channels, fd);
        }
        tables.auth.remove(fd);
        tables.rate_limit.remove(fd);
    }

    pub fn is_open(&self, fd: Fd) -> bool {
        self.connections.contains_key(&fd)
    }

    pub fn remote_addr(&self, fd: Fd) -> Option<String> {
        self.connections.get(&fd).map(|r| r.remote_addr.clone())
    }

    /// Best-effort push to a single FD. A failed send (closed socket,
    /// unknown FD) is a silent drop per spec §4.9 ("Cross-worker push to
    /// closed FD: Silent drop with debug log").
    pub fn push(&self, fd: Fd, message: String) -> bool {
        match self.connections.get(&fd) {
            Some(record) => match record.sender.send(message) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(fd = %fd, "push failed: receiver gone");
                    false
                }
            },
            None => {
                tracing::debug!(fd = %fd, "push to unknown/closed fd dropped");
                false
            }
        }
    }

    /// Record that `fd` joined `channel` in the reverse index. Called after
    /// the Subscriptions table insert succeeds.
    pub async fn track_subscription(&self, fd: Fd, channel: String) {
        if let Some(record) = self.connections.get(&fd) {
            record.channels.lock().await.insert(channel);
        }
    }

    pub async fn untrack_subscription(&self, fd: Fd, channel: &str) {
        if let Some(record) = self.connections.get(&fd) {
            record.channels.lock().await.remove(channel);
        }
    }

    pub async fn channels_of(&self, fd: Fd) -> Vec<String> {
        match self.connections.get(&fd) {
            Some(record) => record.channels.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Wired into [`crate::task_pool::TaskPool::set_delivery`]: deliver a
    /// task completion back to its originating connection as an
    /// `api_response`/`api_error` frame, or log-and-discard if the
    /// connection closed before the result arrived (spec §4.6 "tasks that
    /// outlive their originating connection log and discard their result").
    pub fn deliver_task_completion(&self, completion: TaskCompletion) {
        let Some(fd) = completion.origin_fd else {
            tracing::debug!(correlation_id = %completion.correlation_id, "task completion has no origin fd; discarding");
            return;
        };
        let frame = match completion.outcome {
            Ok(data) => crate::websocket::events::ServerFrame::ApiResponse {
                correlation_id: completion.correlation_id.clone(),
                status: "success".to_string(),
                status_code: 200,
                data: Some(data),
                message: None,
                timestamp: crate::websocket::events::now_ts(),
            },
            Err(message) => crate::websocket::events::ServerFrame::ApiError {
                correlation_id: completion.correlation_id.clone(),
                status: "error".to_string(),
                status_code: 500,
                message,
                timestamp: crate::websocket::events::now_ts(),
            },
        };
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if !self.push(fd, json) {
                    tracing::debug!(
                        correlation_id = %completion.correlation_id,
                        fd = %fd,
                        "task outlived its originating connection; result discarded"
                    );
                }
            }
            Err(e) => tracing::error!(error = ?e, "failed to serialize task completion frame"),
        }
    }
}
