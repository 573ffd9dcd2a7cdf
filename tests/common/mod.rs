// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    extract::ConnectInfo,
    http::{header, Method, Request, StatusCode},
    routing::{any, get},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tower::ServiceExt;

use channel_gateway::auth::{self, Claims};
use channel_gateway::config::{Config, FingerprintMode};
use channel_gateway::fd::FdAllocator;
use channel_gateway::profile::{shared, Profile, ProfileLoader, StaticProfileLoader};
use channel_gateway::router::{GatewayRouter, Scope};
use channel_gateway::state::AppState;
use channel_gateway::task_pool::TaskPool;
use channel_gateway::websocket::{websocket_handler, ConnectionManager};
use channel_gateway::{cache_bridge, handlers};

pub const TEST_JWT_SECRET: &str = "test-secret-min-32-characters-long!!";
pub const TEST_XOR_KEY: &str = "test-xor-key";
pub const TEST_PEER_ADDR: &str = "127.0.0.1:40000";
pub const TEST_ACCOUNT_ID: i64 = 1;
pub const TEST_PROFILE_ID: i64 = 42;
pub const TEST_SCOPE_ENTITY_ID: i64 = 7;

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        jwt_xor_key: TEST_XOR_KEY.to_string(),
        trust_proxy: false,
        event_worker_num: 1,
        task_worker_num: 2,
        allowed_origins: vec!["https://allowed.example".to_string()],
        auth_timeout_secs: 10,
        rate_limit_per_sec: 50.0,
        rate_limit_burst: 100.0,
        fingerprint_mode: FingerprintMode::Off,
        cors_allowed_origins: vec![],
        cors_allowed_methods: vec![],
        cors_allowed_headers: vec![],
        system_key: Some("test-system-key".to_string()),
        is_dev: true,
    }
}

/// Mint a signed bearer token for the demo profile, bound to [`TEST_PEER_ADDR`]'s
/// IP so the pipeline's IP-binding check (spec §4.2 step 6) passes in tests
/// that don't exercise mismatch behavior directly.
pub fn test_token() -> String {
    test_token_with(TEST_SCOPE_ENTITY_ID, "127.0.0.1", "")
}

pub fn test_token_with(scope_entity_id: i64, ip: &str, device_hash: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        account_id: TEST_ACCOUNT_ID,
        profile_id: TEST_PROFILE_ID,
        scope_entity_id,
        device_hash: device_hash.to_string(),
        ip: ip.to_string(),
        iat: now,
        exp: now + 3600,
    };
    auth::sign(&claims, TEST_JWT_SECRET, TEST_XOR_KEY).expect("signing a test token cannot fail")
}

fn demo_profile_loader() -> Arc<dyn ProfileLoader> {
    let mut perms = HashMap::new();
    perms.insert("*".to_string(), Scope::Private);
    shared(StaticProfileLoader::new().with_profile(
        TEST_ACCOUNT_ID,
        Profile {
            profile_id: TEST_PROFILE_ID,
            default_scope_entity_id: TEST_SCOPE_ENTITY_ID,
            accessible_scopes: [TEST_SCOPE_ENTITY_ID].into_iter().collect(),
            permissions: perms,
        },
    ))
}

/// Build the gateway wired exactly like `main.rs`, minus the network bind,
/// signal handlers, and observability layers — those are process wiring,
/// not router behavior, and the teacher's own `create_test_app` draws the
/// same line (no CORS/governor/prometheus layers in its test router either).
pub fn create_test_app() -> (Router, AppState) {
    create_test_app_with(test_config())
}

/// Same as [`create_test_app`] but with a caller-supplied [`Config`] — used
/// by tests that need a tight rate-limit, a short auth timeout, a non-empty
/// origin allow-list, or strict device-fingerprint mode.
pub fn create_test_app_with(config: Config) -> (Router, AppState) {
    let tables = channel_gateway::tables::SharedTables::new();
    let connections = ConnectionManager::new();
    let task_pool = Arc::new(TaskPool::new(config.task_worker_num));
    task_pool.set_delivery(Arc::new({
        let connections = connections.clone();
        move |completion| connections.deliver_task_completion(completion)
    }));

    let mut gateway_router = GatewayRouter::new(config.system_key.clone());
    let state = AppState {
        config: Arc::new(RwLock::new(config)),
        tables: tables.clone(),
        router: Arc::new(GatewayRouter::new(None)),
        profiles: demo_profile_loader(),
        connections,
        task_pool,
        fds: Arc::new(FdAllocator::new()),
    };

    handlers::register(&mut gateway_router, &state);
    cache_bridge::register(&mut gateway_router, tables);
    let state = AppState {
        router: Arc::new(gateway_router),
        ..state
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/*rest", any(channel_gateway::http_gateway::http_gateway))
        .with_state(state.clone());

    (app, state)
}

/// Build the same router as [`create_test_app_with`], but layered with a
/// fixed [`MockConnectInfo`] so it can be driven over a real TCP transport
/// (`axum_test::TestServer::builder().http_transport()`), which — unlike
/// `Router::oneshot` — never goes through `with_peer_addr`'s manual
/// extension insertion and has no `into_make_service_with_connect_info`
/// call of its own to populate `ConnectInfo<SocketAddr>`.
pub fn create_ws_test_app(config: Config) -> (Router, AppState) {
    let (app, state) = create_test_app_with(config);
    let addr: SocketAddr = TEST_PEER_ADDR.parse().expect("valid test peer address");
    (app.layer(MockConnectInfo(addr)), state)
}

pub fn with_peer_addr(mut req: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().expect("valid test peer address");
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

pub async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

pub async fn get_no_auth(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}

pub async fn get_authed(app: Router, uri: &str, token: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}

pub async fn post_json_authed(app: Router, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}

pub async fn post_json_system(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("x-system-key", "test-system-key")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}

/// A public, non-loopback peer address — used to exercise SYSTEM-route
/// gating in the branch where the loopback exemption does not apply.
pub const TEST_REMOTE_PEER_ADDR: &str = "203.0.113.5:51000";

pub async fn get_no_auth_remote(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap();
    send(app, with_peer_addr(req, TEST_REMOTE_PEER_ADDR)).await
}

pub async fn get_system_remote_with_key(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("x-system-key", "test-system-key")
        .body(Body::empty())
        .unwrap();
    send(app, with_peer_addr(req, TEST_REMOTE_PEER_ADDR)).await
}

pub async fn get_system(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("x-system-key", "test-system-key")
        .body(Body::empty())
        .unwrap();
    send(app, with_peer_addr(req, TEST_PEER_ADDR)).await
}
