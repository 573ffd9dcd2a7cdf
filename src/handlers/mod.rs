//! Demonstration business handlers (SPEC_FULL §1: "this crate ships a
//! *small* set of demonstration handlers ... solely to exercise the
//! router/pipeline contract end to end in tests — they are explicitly not
//! 'the business'"). Real endpoint handlers are an external collaborator
//! the spec defines the contract for (RequestContext in, `serde_json::Value`
//! out) but does not itself compute.

use std::sync::Arc;

use axum::http::Method;

use crate::error::{AppError, AppResult};
use crate::pipeline::context::RequestContext;
use crate::router::{GatewayRouter, Scope};
use crate::state::AppState;
use crate::task_pool::TaskEnvelope;

/// `GET /api/ping` — PUBLIC, reachable with no auth at all.
async fn ping(_ctx: RequestContext) -> AppResult<serde_json::Value> {
    Ok(serde_json::json!({ "pong": true }))
}

/// `GET /api/whoami` — PRIVATE: exercises the auth/profile hydration half
/// of the pipeline (step 6).
async fn whoami(ctx: RequestContext) -> AppResult<serde_json::Value> {
    let claims = ctx
        .claims
        .as_ref()
        .ok_or_else(|| AppError::Auth("authentication required".into()))?;
    Ok(serde_json::json!({
        "account_id": claims.account_id,
        "profile_id": claims.profile_id,
        "scope_entity_id": ctx.scope_entity_id,
    }))
}

/// `POST /api/echo` — PUBLIC: echoes back the hydrated named-argument
/// container, so Testable Scenario (c) (explicit query wins over the URI's
/// own query string) can be asserted end to end.
async fn echo(ctx: RequestContext) -> AppResult<serde_json::Value> {
    Ok(serde_json::json!({ "params": ctx.params, "query": ctx.query }))
}

/// `GET /api/ws/pending` — PUBLIC by design (SPEC_FULL "Open question": the
/// storage contract for offline message buffering belongs to a persistence
/// collaborator this spec does not own). Always returns an empty backlog —
/// a real deployment swaps this handler for one backed by that collaborator
/// without touching the router.
async fn ws_pending(_ctx: RequestContext) -> AppResult<serde_json::Value> {
    Ok(serde_json::json!({ "pending": [] }))
}

/// `POST /api/reports/heavy` — PRIVATE: exercises the Task Worker Pool
/// (spec §4.6) end to end. If the request arrived over WebSocket the task
/// is submitted fire-and-forget and correlated back to `ctx.fd` (Testable
/// Scenario (f)); over HTTP there is no FD to correlate against, so the
/// handler awaits the task inline and returns its result directly.
fn make_heavy_report_handler(state: AppState) -> impl Fn(RequestContext) -> crate::router::BoxFuture<'static, AppResult<serde_json::Value>> + Send + Sync + 'static {
    move |ctx: RequestContext| {
        let state = state.clone();
        Box::pin(async move {
            let days = ctx.params.get("days").and_then(|v| v.as_i64()).unwrap_or(0);
            let correlation_id = ctx
                .correlation_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let envelope = TaskEnvelope {
                name: "heavy.report".to_string(),
                payload: serde_json::json!({ "days": days }),
                correlation_id,
                origin_fd: ctx.fd,
            };

            match ctx.fd {
                Some(_) => {
                    state.task_pool.submit(envelope)?;
                    Ok(serde_json::json!({ "accepted": true }))
                }
                None => state.task_pool.submit_and_await(envelope).await,
            }
        })
    }
}

/// Register the demo routes plus the `heavy.report` task handler. Called
/// once from `main` alongside [`crate::cache_bridge::register`].
pub fn register(router: &mut GatewayRouter, state: &AppState) {
    router.register(&[Method::GET], "/api/ping", Scope::Public, Arc::new(|ctx| Box::pin(ping(ctx))));
    router.register(&[Method::GET], "/api/whoami", Scope::Private, Arc::new(|ctx| Box::pin(whoami(ctx))));
    router.register(&[Method::POST], "/api/echo", Scope::Public, Arc::new(|ctx| Box::pin(echo(ctx))));
    router.register(
        &[Method::GET],
        "/api/ws/pending",
        Scope::Public,
        Arc::new(|ctx| Box::pin(ws_pending(ctx))),
    );
    router.register(
        &[Method::POST],
        "/api/reports/heavy",
        Scope::Private,
        Arc::new(make_heavy_report_handler(state.clone())),
    );

    state.task_pool.register("heavy.report", |payload| async move {
        let days = payload["days"].as_i64().unwrap_or(0);
        Ok(serde_json::json!({ "rows": days * 10 }))
    });
}
