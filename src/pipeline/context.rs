//! `RequestContext`: the per-request ambient state the Request Context
//! Isolator snapshots on entry and restores on exit. A process-global
//! ("superglobal") mutated in place would be unsound once many logical
//! requests interleave inside one worker, so this uses `tokio::task_local!`
//! instead: each call to [`crate::pipeline::run`] opens its own `.scope()`,
//! so concurrent requests on the same OS thread never observe each other's
//! ambient state — isolation falls out of ownership, not discipline.

use std::cell::RefCell;
use std::collections::HashMap;

use axum::http::Method;
use serde_json::Value;

use crate::auth::Claims;
use crate::fd::Fd;
use crate::profile::Profile;
use crate::router::Transport;

/// Everything a handler may observe about the request that invoked it.
/// Cheap to clone (an owned copy per handler call is exactly how isolation
/// is achieved without locks).
#[derive(Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Path only — query string has already been split out in step 1.
    pub path: String,
    /// Header names canonicalized to lowercase.
    pub headers: HashMap<String, String>,
    pub body: Value,
    /// Merged query map: explicit payload query wins over the URI's own
    /// query string.
    pub query: HashMap<String, Value>,
    /// Named-argument container hydrated from method+body+query (step 5) —
    /// handlers read parameters from here uniformly regardless of transport.
    pub params: HashMap<String, Value>,
    pub remote_addr: String,
    pub transport: Transport,
    pub correlation_id: Option<String>,
    pub claims: Option<Claims>,
    pub profile: Option<Profile>,
    /// The scope the request is actually executing under, after JWT scope
    /// coercion — may differ from `claims.scope_entity_id`.
    pub scope_entity_id: i64,
    /// Set only for WebSocket-originated requests; lets a handler enqueue a
    /// task offload correlated back to the connection that asked for it.
    pub fd: Option<Fd>,
    pub status_code: u16,
}

impl RequestContext {
    pub fn is_authenticated(&self) -> bool {
        self.claims.is_some()
    }

    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            headers: HashMap::new(),
            body: Value::Null,
            query: HashMap::new(),
            params: HashMap::new(),
            remote_addr: "127.0.0.1".to_string(),
            transport: Transport::Http,
            correlation_id: None,
            claims: None,
            profile: None,
            scope_entity_id: 0,
            fd: None,
            status_code: 200,
        }
    }
}

tokio::task_local! {
    /// A process-global-style "superglobal", reborn as a task-local cell.
    /// Only [`crate::pipeline::run`] writes to it; handlers may read it via
    /// [`current`] instead of taking a `RequestContext` parameter, if they
    /// prefer the ambient style.
    static AMBIENT: RefCell<Option<RequestContext>>;
}

/// Read a clone of the ambient context for the currently executing request,
/// if called from inside [`crate::pipeline::run`]'s scope.
pub fn current() -> Option<RequestContext> {
    AMBIENT.try_with(|cell| cell.borrow().clone()).unwrap_or(None)
}

pub(crate) fn set_ambient(ctx: RequestContext) {
    let _ = AMBIENT.try_with(|cell| *cell.borrow_mut() = Some(ctx));
}

pub(crate) fn reset_ambient() {
    let _ = AMBIENT.try_with(|cell| *cell.borrow_mut() = None);
}

/// Run `fut` inside a fresh, empty ambient scope: snapshot on entry, reset
/// profile state, restore on exit. Each call gets its own task-local
/// storage, so sibling logical requests on the same worker thread never
/// bleed into each other even though they interleave.
pub async fn isolated<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    AMBIENT.scope(RefCell::new(None), fut).await
}
