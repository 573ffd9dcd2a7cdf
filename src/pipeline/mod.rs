//! The Unified Request Pipeline: the nine steps that make one route
//! definition reachable over both HTTP and WebSocket. Both transports build
//! a [`RawRequest`] and hand it to [`run`] — this function *is* "the
//! unification".

pub mod context;

use std::collections::HashMap;

use axum::http::Method;
use serde_json::Value;

use crate::config::FingerprintMode;
use crate::error::{AppError, AppResult};
use crate::fd::Fd;
use crate::router::Transport;
use crate::state::AppState;
use context::RequestContext;

/// Transport-agnostic input to the pipeline. The HTTP gateway and the WS
/// `api`-frame handler each build one of these from their own wire format
/// and call [`run`] — everything past this point is shared code.
pub struct RawRequest {
    pub method: Method,
    /// May still carry a `?query=string` suffix (step 1 splits it off).
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    /// Explicit query map already present in the payload (e.g. a WS `api`
    /// frame's `query` field). Wins over the URI's own query string.
    pub explicit_query: HashMap<String, Value>,
    pub remote_addr: String,
    pub transport: Transport,
    pub correlation_id: Option<String>,
    /// An explicit token carried in the payload itself, lowest-priority
    /// source in the bearer-token resolution order (step 6).
    pub token_override: Option<String>,
    /// `meta.fingerprint` from the payload, compared against the bound
    /// connection's stored device hash (step 7).
    pub fingerprint: Option<String>,
    /// Bound only for WebSocket frames — lets step 6 prefer the FD's
    /// already-established `AuthEntry` over re-verifying a header/cookie.
    pub fd: Option<Fd>,
}

/// What the pipeline produced. `DeviceMismatch` is distinguished from a
/// plain error because the caller must additionally close the connection
/// (WS) — it is not a `Result::Err` because it's expected, policy-driven
/// behavior, not a failure of the pipeline itself.
pub enum PipelineOutcome {
    Success { data: Value, status_code: u16 },
    DeviceMismatch,
}

fn canonicalize_headers(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

/// Percent-decode a query string component. No query-string crate is in the
/// dependency stack (the gateway's own config wiring is the only other
/// place that would need one, and doesn't); this is the minimal decoder
/// step 1 needs and nothing more.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query_string(qs: &str) -> HashMap<String, Value> {
    qs.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), Value::String(percent_decode(v))),
            None => (percent_decode(pair), Value::String(String::new())),
        })
        .collect()
}

/// Step 1: split the raw URI into path + query, merging any explicit query
/// map from the payload (explicit wins) — spec Testable Scenario (c).
fn split_and_merge_query(raw_uri: &str, explicit: HashMap<String, Value>) -> (String, HashMap<String, Value>) {
    let (path, qs) = match raw_uri.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (raw_uri.to_string(), ""),
    };
    let mut merged = parse_query_string(qs);
    for (k, v) in explicit {
        merged.insert(k, v);
    }
    (path, merged)
}

/// Step 5: hydrate the uniform named-argument container from method + body
/// + query. GET-like requests have no body to speak of; everything else
/// starts from the body object and layers the query on top.
fn hydrate_params(method: &Method, body: &Value, query: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut params = HashMap::new();
    if method != Method::GET && method != Method::HEAD {
        if let Value::Object(map) = body {
            for (k, v) in map {
                params.insert(k.clone(), v.clone());
            }
        }
    }
    for (k, v) in query {
        params.insert(k.clone(), v.clone());
    }
    params
}

fn extract_cookie(headers: &HashMap<String, String>, name: &str) -> Option<String> {
    let raw = headers.get("cookie")?;
    raw.split(';').find_map(|kv| {
        let (k, v) = kv.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

/// Step 6: resolve a bearer token in priority order — already-bound
/// `AuthEntry` (WS), `Authorization: Bearer`, `bnxt` cookie, explicit
/// payload field.
fn resolve_token(state: &AppState, headers: &HashMap<String, String>, fd: Option<Fd>, token_override: &Option<String>) -> Option<String> {
    if let Some(fd) = fd {
        if let Some(entry) = state.tables.auth.get(fd) {
            return Some(entry.token);
        }
    }
    if let Some(auth_header) = headers.get("authorization") {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    if let Some(cookie_token) = extract_cookie(headers, "bnxt") {
        return Some(cookie_token);
    }
    token_override.clone()
}

/// Run the nine-step pipeline (spec §4.2) shared verbatim by the HTTP
/// catch-all route and the WS `api` frame handler.
pub async fn run(state: &AppState, raw: RawRequest) -> AppResult<PipelineOutcome> {
    context::isolated(run_inner(state, raw)).await
}

async fn run_inner(state: &AppState, raw: RawRequest) -> AppResult<PipelineOutcome> {
    // Step 1: URI/query split + merge.
    let (path, query) = split_and_merge_query(&raw.uri, raw.explicit_query);

    // Steps 2/3: ambient snapshot + profile reset are implicit in
    // `context::isolated` opening a fresh, empty task-local scope.

    // Step 4: hydrate ambient state from the request.
    let headers = canonicalize_headers(raw.headers);
    let params = hydrate_params(&raw.method, &raw.body, &query); // step 5

    let mut ctx = RequestContext {
        method: raw.method.clone(),
        path: path.clone(),
        headers: headers.clone(),
        body: raw.body,
        query,
        params,
        remote_addr: raw.remote_addr.clone(),
        transport: raw.transport,
        correlation_id: raw.correlation_id.clone(),
        claims: None,
        profile: None,
        scope_entity_id: 0,
        fd: raw.fd,
        status_code: 200,
    };

    // Step 6: token resolution + verification.
    let config = state.config.read().await.clone();
    let now = chrono::Utc::now().timestamp();
    if let Some(token) = resolve_token(state, &headers, raw.fd, &raw.token_override) {
        match crate::auth::verify(
            &token,
            &config.jwt_secret,
            &config.jwt_xor_key,
            &raw.remote_addr,
            config.trust_proxy,
            now,
        ) {
            Ok(claims) => match state.profiles.load(claims.account_id, claims.profile_id).await {
                Ok(profile) => {
                    let scope = crate::profile::coerce_scope(claims.scope_entity_id, &profile);
                    ctx.scope_entity_id = scope;
                    ctx.claims = Some(claims);
                    ctx.profile = Some(profile);
                }
                Err(e) => {
                    // Unresolvable profile on an implicit API call leaves the
                    // request unauthenticated rather than failing it — only
                    // explicit `auth` frames (handled in the connection
                    // manager) turn token problems into a hard 401.
                    tracing::warn!(error = %e, "token verified but profile could not be loaded; proceeding unauthenticated");
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "bearer token did not verify; proceeding unauthenticated");
            }
        }
    }

    context::set_ambient(ctx.clone());

    // Step 7: device-fingerprint cross-check.
    let stored_device_hash = raw
        .fd
        .and_then(|fd| state.tables.auth.get(fd))
        .map(|e| e.device_hash)
        .or_else(|| ctx.claims.as_ref().map(|c| c.device_hash.clone()));

    if let (Some(stored), Some(presented)) = (stored_device_hash, raw.fingerprint.as_ref()) {
        if !stored.is_empty() && &stored != presented {
            match config.fingerprint_mode {
                FingerprintMode::Off => {}
                FingerprintMode::Log => {
                    tracing::warn!(
                        security = true,
                        event = "DEVICE_FINGERPRINT_MISMATCH",
                        path = %path,
                        "device fingerprint mismatch (log mode, request proceeds)"
                    );
                }
                FingerprintMode::Strict => {
                    tracing::warn!(
                        security = true,
                        event = "DEVICE_FINGERPRINT_MISMATCH",
                        path = %path,
                        "device fingerprint mismatch (strict mode, closing connection)"
                    );
                    context::reset_ambient();
                    return Ok(PipelineOutcome::DeviceMismatch);
                }
            }
        }
    }

    // Step 8: dispatch through the router, buffering handler output.
    let permissions = ctx
        .profile
        .as_ref()
        .map(|p| p.permissions.clone())
        .unwrap_or_default();
    let system_key_header = headers.get("x-system-key").cloned();
    let remote_is_loopback = raw
        .remote_addr
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false);

    let dispatch_result = state
        .router
        .dispatch(
            &raw.method,
            &path,
            &permissions,
            system_key_header.as_deref(),
            remote_is_loopback,
            ctx,
        )
        .await;

    // Step 9: emit + restore (restore happens for free when `isolated`'s
    // future returns, tearing down the task-local scope).
    context::reset_ambient();

    match dispatch_result {
        Ok(data) => Ok(PipelineOutcome::Success { data, status_code: 200 }),
        Err(AppError::Handler(msg)) => {
            tracing::error!(path = %path, error = %msg, "handler failure");
            Err(AppError::Handler(msg))
        }
        Err(other) => Err(other),
    }
}
