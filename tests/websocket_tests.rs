mod common;

use std::time::Duration;

use axum_test::TestServer;
use channel_gateway::config::{Config, FingerprintMode};
use serde_json::{json, Value};

fn test_server(config: Config) -> TestServer {
    let (app, _state) = common::create_ws_test_app(config);
    TestServer::builder()
        .http_transport()
        .build(app)
        .expect("failed to build test server")
}

// ============================================================================
// Testable Scenario (a): happy auth, then subscribe, then publish
// ============================================================================

#[tokio::test]
async fn happy_path_auth_subscribe_then_publish() {
    let (app, state) = common::create_ws_test_app(common::test_config());
    let server = TestServer::builder()
        .http_transport()
        .build(app)
        .expect("failed to build test server");
    let token = common::test_token();

    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let connected: Value = ws.receive_json().await;
    assert_eq!(connected["type"], "system");
    assert_eq!(connected["event"], "connected");

    ws.send_json(&json!({"type": "auth", "token": token})).await;
    let authed: Value = ws.receive_json().await;
    assert_eq!(authed["type"], "authenticated");
    assert_eq!(authed["profile_id"], common::TEST_PROFILE_ID);
    assert_eq!(authed["scope_entity_id"], common::TEST_SCOPE_ENTITY_ID);

    ws.send_json(&json!({"type": "subscribe", "channel": "room:a"})).await;
    let subscribed: Value = ws.receive_json().await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["channel"], "room:a");

    // Let the connection manager finish recording the subscription in its
    // per-FD reverse index before publishing against it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fanned_out = channel_gateway::pubsub::publish(&state, "room:a", json!({"hello": "world"}));
    assert_eq!(fanned_out, 1);

    let pushed: Value = ws.receive_json().await;
    assert_eq!(pushed["type"], "publish");
    assert_eq!(pushed["channel"], "room:a");
    assert_eq!(pushed["data"]["hello"], "world");
}

#[tokio::test]
async fn subscribe_without_authentication_is_rejected() {
    let server = test_server(common::test_config());
    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    ws.send_json(&json!({"type": "subscribe", "channel": "room:a"})).await;
    let frame: Value = ws.receive_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["status_code"], 401);
}

// ============================================================================
// Testable Scenario (b): rate limit — rate=2/s, burst=3, 5 pings back-to-back
// ============================================================================

#[tokio::test]
async fn rate_limit_admits_exactly_burst_many_frames() {
    let config = Config {
        rate_limit_per_sec: 2.0,
        rate_limit_burst: 3.0,
        ..common::test_config()
    };
    let server = test_server(config);
    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    for i in 0..5 {
        ws.send_json(&json!({"type": "ping", "ts": i})).await;
    }

    let mut pongs = 0;
    let mut rate_limited = 0;
    for _ in 0..5 {
        let frame: Value = ws.receive_json().await;
        match frame["type"].as_str().unwrap() {
            "pong" => pongs += 1,
            "error" => {
                assert_eq!(frame["status_code"], 429);
                rate_limited += 1;
            }
            other => panic!("unexpected frame type: {other}"),
        }
    }
    assert_eq!(pongs, 3);
    assert_eq!(rate_limited, 2);
}

// ============================================================================
// Testable Scenario (c): ambiguous URI parsing — explicit query wins
// ============================================================================

#[tokio::test]
async fn explicit_query_wins_over_the_uri_query_string() {
    let server = test_server(common::test_config());
    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    ws.send_json(&json!({
        "type": "api",
        "route": "/api/echo?page=2&limit=50",
        "method": "POST",
        "query": {"limit": 10},
        "correlation_id": "c1"
    }))
    .await;

    let response: Value = ws.receive_json().await;
    assert_eq!(response["type"], "api_response");
    assert_eq!(response["correlation_id"], "c1");
    assert_eq!(response["data"]["query"]["page"], "2");
    assert_eq!(response["data"]["query"]["limit"], 10);
}

// ============================================================================
// Testable Scenario (d): device-fingerprint mismatch in strict mode
// ============================================================================

#[tokio::test]
async fn device_mismatch_in_strict_mode_replies_then_closes() {
    let config = Config {
        fingerprint_mode: FingerprintMode::Strict,
        ..common::test_config()
    };
    let server = test_server(config);
    let device_hash = "a".repeat(32);
    let token = common::test_token_with(common::TEST_SCOPE_ENTITY_ID, "127.0.0.1", &device_hash);

    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;
    ws.send_json(&json!({"type": "auth", "token": token})).await;
    let _authed: Value = ws.receive_json().await;

    ws.send_json(&json!({
        "type": "api",
        "route": "/api/ping",
        "method": "GET",
        "meta": {"fingerprint": "b".repeat(32)},
        "correlation_id": "c2"
    }))
    .await;

    let mismatch: Value = ws.receive_json().await;
    assert_eq!(mismatch["type"], "error");
    assert_eq!(mismatch["event"], "device_mismatch");

    // The connection is closed immediately after — either the next read
    // errors out or never resolves; either outcome confirms no further
    // frame (and no handler invocation) follows the mismatch reply.
    let handle = tokio::spawn(async move {
        let _: Value = ws.receive_json().await;
    });
    let outcome = tokio::time::timeout(Duration::from_millis(500), handle).await;
    assert!(
        !matches!(outcome, Ok(Ok(()))),
        "connection should have closed instead of sending another frame"
    );
}

// ============================================================================
// Testable Property 8 / Scenario: origin not on the allow-list closes the
// connection before any `system.connected` frame is sent.
// ============================================================================

#[tokio::test]
async fn disallowed_origin_never_receives_system_connected() {
    let config = Config {
        allowed_origins: vec!["https://allowed.example".to_string()],
        ..common::test_config()
    };
    let server = test_server(config);

    let mut ws = server
        .get_websocket("/ws")
        .add_header(axum::http::header::ORIGIN, "https://evil.example")
        .await
        .into_websocket()
        .await;

    let handle = tokio::spawn(async move {
        let _: Value = ws.receive_json().await;
    });
    let outcome = tokio::time::timeout(Duration::from_millis(500), handle).await;
    assert!(
        !matches!(outcome, Ok(Ok(()))),
        "no frame (not even system.connected) should reach a disallowed origin"
    );
}

#[tokio::test]
async fn allowed_origin_still_receives_system_connected() {
    let config = Config {
        allowed_origins: vec!["https://allowed.example".to_string()],
        ..common::test_config()
    };
    let server = test_server(config);

    let mut ws = server
        .get_websocket("/ws")
        .add_header(axum::http::header::ORIGIN, "https://allowed.example")
        .await
        .into_websocket()
        .await;

    let connected: Value = ws.receive_json().await;
    assert_eq!(connected["type"], "system");
}

// ============================================================================
// Testable Property 5: auth-timeout
// ============================================================================

#[tokio::test]
async fn auth_timeout_closes_an_unauthenticated_connection() {
    let config = Config {
        auth_timeout_secs: 1,
        ..common::test_config()
    };
    let server = test_server(config);

    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    let frame: Value = tokio::time::timeout(Duration::from_secs(3), async { ws.receive_json().await })
        .await
        .expect("auth-timeout error frame should have arrived by now");
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["status_code"], 401);
}

#[tokio::test]
async fn authenticating_before_the_timeout_disarms_it() {
    let config = Config {
        auth_timeout_secs: 1,
        ..common::test_config()
    };
    let server = test_server(config);
    let token = common::test_token();

    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;
    ws.send_json(&json!({"type": "auth", "token": token})).await;
    let authed: Value = ws.receive_json().await;
    assert_eq!(authed["type"], "authenticated");

    // Wait past the timeout; the connection must still be alive because it
    // authenticated in time.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    ws.send_json(&json!({"type": "ping", "ts": 1})).await;
    let pong: Value = ws.receive_json().await;
    assert_eq!(pong["type"], "pong");
}

// ============================================================================
// Testable Scenario (f): task offload with correlation
// ============================================================================

#[tokio::test]
async fn task_offload_delivers_a_correlated_completion_frame() {
    let server = test_server(common::test_config());
    let token = common::test_token();

    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;
    ws.send_json(&json!({"type": "auth", "token": token})).await;
    let _authed: Value = ws.receive_json().await;

    ws.send_json(&json!({
        "type": "api",
        "route": "/api/reports/heavy",
        "method": "POST",
        "body": {"days": 30},
        "correlation_id": "c-heavy"
    }))
    .await;

    // The handler submits fire-and-forget and replies immediately.
    let accepted: Value = ws.receive_json().await;
    assert_eq!(accepted["type"], "api_response");
    assert_eq!(accepted["data"]["accepted"], true);

    // The task worker's completion arrives later, correlated by id.
    let completion: Value = ws.receive_json().await;
    assert_eq!(completion["type"], "api_response");
    assert_eq!(completion["correlation_id"], "c-heavy");
    assert_eq!(completion["data"]["rows"], 300);
}

// ============================================================================
// Failure semantics: missing `type` field, no `route`/`uri` present either
// ============================================================================

#[tokio::test]
async fn frame_with_neither_type_nor_route_is_a_400() {
    let server = test_server(common::test_config());
    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    ws.send_json(&json!({"foo": "bar"})).await;
    let frame: Value = ws.receive_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["status_code"], 400);
}

#[tokio::test]
async fn ping_echoes_the_client_timestamp() {
    let server = test_server(common::test_config());
    let mut ws = server.get_websocket("/ws").await.into_websocket().await;
    let _connected: Value = ws.receive_json().await;

    ws.send_json(&json!({"type": "ping", "ts": 1_710_000_000_i64})).await;
    let pong: Value = ws.receive_json().await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 1_710_000_000_i64);
}
