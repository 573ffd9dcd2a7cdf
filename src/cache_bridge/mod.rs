//! The Cache Bridge (spec §4.7): a handful of SYSTEM-scoped routes under
//! `/api/_internal/cache/*` that expose the shared Cache table over the same
//! HTTP surface the rest of the gateway serves, so a short-lived sibling
//! process — one that does not share this process's address space and
//! therefore cannot hold an `Arc<SharedTables>` of its own — can still read
//! and write the same cache over loopback HTTP.
//!
//! These are registered as ordinary routes on the same [`GatewayRouter`]
//! used for everything else (spec SPEC_FULL §5: "this crate exposes them as
//! ordinary axum routes ... so both paths are the same code") — there is no
//! separate bridge server.

use std::sync::Arc;

use axum::http::Method;

use crate::error::{AppError, AppResult};
use crate::pipeline::context::RequestContext;
use crate::router::{GatewayRouter, Scope};
use crate::tables::{SharedTables, CACHE_KEY_MAX_BYTES, CACHE_VALUE_MAX_BYTES};

fn require_string_param(ctx: &RequestContext, name: &str) -> AppResult<String> {
    ctx.params
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::Input(format!("missing required field '{name}'")))
}

/// Register the four bridge routes onto `router`. Called once from `main`
/// with the same `Arc<SharedTables>` every other component shares.
pub fn register(router: &mut GatewayRouter, tables: Arc<SharedTables>) {
    let get_tables = tables.clone();
    router.register(
        &[Method::GET, Method::POST],
        "/api/_internal/cache/get",
        Scope::System,
        Arc::new(move |ctx: RequestContext| {
            let tables = get_tables.clone();
            Box::pin(async move {
                let key = require_string_param(&ctx, "key")?;
                let now = chrono::Utc::now().timestamp();
                match tables.cache.get(&key, now) {
                    Some(data) => {
                        let value: serde_json::Value =
                            serde_json::from_slice(&data).unwrap_or(serde_json::Value::Null);
                        Ok(serde_json::json!({ "found": true, "value": value }))
                    }
                    None => Ok(serde_json::json!({ "found": false, "value": null })),
                }
            })
        }),
    );

    let set_tables = tables.clone();
    router.register(
        &[Method::POST],
        "/api/_internal/cache/set",
        Scope::System,
        Arc::new(move |ctx: RequestContext| {
            let tables = set_tables.clone();
            Box::pin(async move {
                let key = require_string_param(&ctx, "key")?;
                let value = ctx
                    .params
                    .get("value")
                    .cloned()
                    .ok_or_else(|| AppError::Input("missing required field 'value'".into()))?;
                let expires_at = ctx
                    .params
                    .get("expires_at")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);

                if key.len() > CACHE_KEY_MAX_BYTES {
                    return Err(AppError::Input(format!(
                        "key exceeds {CACHE_KEY_MAX_BYTES} bytes"
                    )));
                }
                let data = serde_json::to_vec(&value)
                    .map_err(|e| AppError::Input(format!("value is not serializable: {e}")))?;
                if data.len() > CACHE_VALUE_MAX_BYTES {
                    return Err(AppError::Input(format!(
                        "value exceeds {CACHE_VALUE_MAX_BYTES} bytes"
                    )));
                }

                tables
                    .cache
                    .set(&key, data, expires_at)
                    .map_err(|_| AppError::ResourceExhaustion("cache table is full".into()))?;
                Ok(serde_json::json!({ "ok": true }))
            })
        }),
    );

    let delete_tables = tables.clone();
    router.register(
        &[Method::POST, Method::DELETE],
        "/api/_internal/cache/delete",
        Scope::System,
        Arc::new(move |ctx: RequestContext| {
            let tables = delete_tables.clone();
            Box::pin(async move {
                let key = require_string_param(&ctx, "key")?;
                tables.cache.delete(&key);
                Ok(serde_json::json!({ "ok": true }))
            })
        }),
    );

    let metrics_tables = tables;
    router.register(
        &[Method::GET],
        "/api/_internal/cache/metrics",
        Scope::System,
        Arc::new(move |_ctx: RequestContext| {
            let tables = metrics_tables.clone();
            Box::pin(async move { Ok(serde_json::to_value(tables.occupancy()).unwrap()) })
        }),
    );
}
