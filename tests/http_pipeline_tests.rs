mod common;

use axum::http::StatusCode;
use serde_json::json;

// ============================================================================
// GET /api/ping — PUBLIC, reachable with no auth at all
// ============================================================================

#[tokio::test]
async fn ping_is_reachable_without_a_token() {
    let (app, _state) = common::create_test_app();
    let (status, body) = common::get_no_auth(app, "/api/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pong"], true);
}

// ============================================================================
// GET /api/whoami — PRIVATE, exercises step 6 (token resolution + profile
// hydration) of the unified pipeline over HTTP
// ============================================================================

#[tokio::test]
async fn whoami_without_a_token_is_unauthorized() {
    let (app, _state) = common::create_test_app();
    let (status, _body) = common::get_no_auth(app, "/api/whoami").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn whoami_with_a_valid_token_resolves_the_profile() {
    let (app, _state) = common::create_test_app();
    let token = common::test_token();
    let (status, body) = common::get_authed(app, "/api/whoami", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_id"], common::TEST_ACCOUNT_ID);
    assert_eq!(body["profile_id"], common::TEST_PROFILE_ID);
    assert_eq!(body["scope_entity_id"], common::TEST_SCOPE_ENTITY_ID);
}

#[tokio::test]
async fn whoami_with_a_token_bound_to_a_different_ip_is_unauthorized() {
    let (app, _state) = common::create_test_app();
    // Signed for a peer that isn't the one making the request.
    let token = common::test_token_with(common::TEST_SCOPE_ENTITY_ID, "10.0.0.9", "");
    let (status, _body) = common::get_authed(app, "/api/whoami", &token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// JWT scope coercion (spec §4.3 / Testable Property 6): a token claiming a
// scope the profile cannot access runs under the profile's default scope
// instead of being rejected.
// ============================================================================

#[tokio::test]
async fn token_claiming_an_inaccessible_scope_is_coerced_to_the_default() {
    let (app, _state) = common::create_test_app();
    let token = common::test_token_with(999_999, "127.0.0.1", "");
    let (status, body) = common::get_authed(app, "/api/whoami", &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope_entity_id"], common::TEST_SCOPE_ENTITY_ID);
}

// ============================================================================
// Malformed request bodies — spec §4.9 "Malformed JSON ... Reply error 400"
// ============================================================================

#[tokio::test]
async fn malformed_json_body_is_a_400() {
    use axum::body::Body;
    use axum::http::{header, Method, Request};

    let (app, _state) = common::create_test_app();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not valid json"))
        .unwrap();
    let (status, _body) = common::send(app, common::with_peer_addr(req, common::TEST_PEER_ADDR)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Unknown route — falls through the router with a 400 (spec §4.4: no
// matching handler is an InputError, not a framework-level 404)
// ============================================================================

#[tokio::test]
async fn unknown_route_is_a_400() {
    let (app, _state) = common::create_test_app();
    let (status, _body) = common::get_no_auth(app, "/api/does/not/exist").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Cache Bridge (spec §4.7): SYSTEM-scoped `/api/_internal/cache/*` routes
// ============================================================================

#[tokio::test]
async fn cache_bridge_set_then_get_roundtrips_over_http() {
    let (app, _state) = common::create_test_app();

    let (status, _) =
        common::post_json_system(app.clone(), "/api/_internal/cache/set", json!({"key": "k1", "value": {"n": 1}}))
            .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        common::post_json_system(app, "/api/_internal/cache/get", json!({"key": "k1"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["found"], true);
    assert_eq!(body["value"]["n"], 1);
}

#[tokio::test]
async fn cache_bridge_rejects_oversized_value() {
    let (app, _state) = common::create_test_app();
    let huge = "x".repeat(9000);
    let (status, _body) = common::post_json_system(
        app,
        "/api/_internal/cache/set",
        json!({"key": "big", "value": huge}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn system_route_is_reachable_from_a_non_loopback_peer_with_the_key() {
    let (app, _state) = common::create_test_app();
    let (status, body) = common::get_system_remote_with_key(app, "/api/_internal/cache/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cache"].is_array());
}

#[tokio::test]
async fn system_route_is_rejected_from_a_non_loopback_peer_without_the_key() {
    let (app, _state) = common::create_test_app();
    let (status, _body) = common::get_no_auth_remote(app, "/api/_internal/cache/metrics").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ============================================================================
// Handler failure semantics (spec §7 HandlerFailure, §4.6 Task Worker Pool
// over HTTP): an HTTP-originated task offload with no registered task
// handler surfaces as a generic 400 (InputError), never a leaked exception.
// ============================================================================

#[tokio::test]
async fn heavy_report_runs_inline_over_http_and_returns_rows() {
    let (app, _state) = common::create_test_app();
    let token = common::test_token();
    let (status, body) = common::post_json_authed(
        app,
        "/api/reports/heavy",
        &token,
        json!({"days": 30}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"], 300);
}

#[tokio::test]
async fn heavy_report_requires_authentication() {
    let (app, _state) = common::create_test_app();
    let (status, _body) = common::post_json(app, "/api/reports/heavy", json!({"days": 30})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
