//! The Router: maps (method, path) to handlers, carries the active
//! transport tag and the caller's resolved permissions, and enforces the
//! declared `Scope` of a handler against what the caller's profile grants
//! for any permission pattern matching the URI.
//!
//! Route registration is static *registrar* composition: a list of
//! `fn(&mut GatewayRouter)` called in order, where a later registrar
//! re-registering the same `(method, pattern)` replaces the earlier one
//! (see [`GatewayRouter::load`]).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::pipeline::context::RequestContext;

/// The four permission classes a registered route may declare. Declaration
/// order is significant: `derive(Ord)` makes `Public < Private < Write <
/// System`, which is exactly the `<=` comparison the scope check needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Public,
    Private,
    Write,
    System,
}

/// Which transport carried the current request — visible to handlers via
/// `RequestContext::transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Ws,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered handler. Boxed/`dyn` because routes are assembled at
/// runtime from heterogeneous async functions, much like `axum::routing`'s
/// own handler registration — just one level lower, since the gateway
/// dispatches the same handler over two transports instead of delegating to
/// axum's own router for both.
pub type HandlerFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, AppResult<serde_json::Value>> + Send + Sync>;

#[derive(Clone)]
struct RouteEntry {
    method: Method,
    pattern: String,
    scope: Scope,
    handler: HandlerFn,
}

/// A registrar: a plain function that calls `router.register(...)` some
/// number of times. `GatewayRouter::load` takes a list of these in order.
pub type Registrar = fn(&mut GatewayRouter);

pub struct GatewayRouter {
    routes: Vec<RouteEntry>,
    /// Pre-shared secret accepted via `X-System-Key` on SYSTEM routes.
    system_key: Option<String>,
}

fn pattern_matches(pattern: &str, uri: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return uri.starts_with(prefix);
    }
    pattern == uri
}

impl GatewayRouter {
    pub fn new(system_key: Option<String>) -> Self {
        Self {
            routes: Vec::new(),
            system_key,
        }
    }

    /// Record a route for side-effect registration. A later call with the
    /// same `(method, pattern)` replaces the earlier one, so a
    /// custom-registrar route can override one a base registrar already
    /// declared, as long as it loads later.
    pub fn register(&mut self, methods: &[Method], pattern: &str, scope: Scope, handler: HandlerFn) {
        for method in methods {
            self.routes
                .retain(|e| !(e.method == *method && e.pattern == pattern));
            self.routes.push(RouteEntry {
                method: method.clone(),
                pattern: pattern.to_string(),
                scope,
                handler: handler.clone(),
            });
        }
    }

    /// Run a list of registrars in order. Later ones override earlier ones
    /// for the same route, which is how a custom registrar can override a
    /// base package's route by being loaded last.
    pub fn load(&mut self, registrars: &[Registrar]) {
        for registrar in registrars {
            registrar(self);
        }
    }

    /// Pick the registered handler whose path matches the URI: exact match
    /// wins, otherwise the longest matching wildcard pattern.
    fn find(&self, method: &Method, uri: &str) -> Option<&RouteEntry> {
        if let Some(exact) = self
            .routes
            .iter()
            .find(|e| &e.method == method && e.pattern == uri)
        {
            return Some(exact);
        }
        self.routes
            .iter()
            .filter(|e| &e.method == method && e.pattern.ends_with('*'))
            .filter(|e| pattern_matches(&e.pattern, uri))
            .max_by_key(|e| e.pattern.len())
    }

    /// The maximum scope the caller's permission map grants for any pattern
    /// matching `uri`. No matching pattern at all means `Scope::Public` —
    /// an unauthenticated caller can still reach PUBLIC routes.
    fn granted_scope(permissions: &HashMap<String, Scope>, uri: &str) -> Scope {
        permissions
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, uri))
            .map(|(_, scope)| *scope)
            .max()
            .unwrap_or(Scope::Public)
    }

    fn authorize_system(&self, system_key_header: Option<&str>, remote_is_loopback: bool) -> AppResult<()> {
        let key_matches = matches!(
            (&self.system_key, system_key_header),
            (Some(expected), Some(given)) if expected == given
        );
        if key_matches || remote_is_loopback {
            Ok(())
        } else {
            Err(AppError::Policy(
                "SYSTEM route requires X-System-Key or a loopback address".into(),
                StatusCode::FORBIDDEN,
            ))
        }
    }

    /// Resolve, authorize, and invoke the handler for `(method, uri)`.
    /// `ctx` carries the fully hydrated `RequestContext` (pipeline step 8).
    pub async fn dispatch(
        &self,
        method: &Method,
        uri: &str,
        permissions: &HashMap<String, Scope>,
        system_key_header: Option<&str>,
        remote_is_loopback: bool,
        ctx: RequestContext,
    ) -> AppResult<serde_json::Value> {
        let entry = self
            .find(method, uri)
            .ok_or_else(|| AppError::Input(format!("no route for {method} {uri}")))?
            .clone();

        if entry.scope == Scope::System {
            // The X-System-Key/loopback check is this route class's entire
            // authorization story (spec §4.7's bridge caller has no JWT and
            // so no profile-derived permissions at all) — it stands in for,
            // not alongside, the granted-scope comparison below.
            self.authorize_system(system_key_header, remote_is_loopback)?;
        } else {
            let granted = Self::granted_scope(permissions, uri);
            if entry.scope > granted {
                return Err(AppError::Policy(
                    "insufficient scope for this route".into(),
                    StatusCode::FORBIDDEN,
                ));
            }
        }

        (entry.handler)(ctx).await
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
