//! HTTP surface of the relay server

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use provider_core::StaticKeyIssuer;
use server::{build_router, AppState, ServeMode, ServerConfig};
use tower::ServiceExt;
use uuid::Uuid;

use common::*;

fn create_test_app(config: ServerConfig) -> Router {
    build_router(AppState::new(config))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_check() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let (status, body) = get_json(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["approach"], "relay-and-direct");

    let (status, body) = get_json(app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_health_reports_direct_approach() {
    let config = ServerConfig {
        mode: ServeMode::Direct,
        ..test_config("ws://127.0.0.1:9/v1/speak")
    };
    let (_, body) = get_json(create_test_app(config), "/api/health").await;
    assert_eq!(body["approach"], "direct-connection");
}

#[tokio::test]
async fn test_request_id_header() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let request_id = response.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert!(Uuid::parse_str(request_id).is_ok());
}

#[tokio::test]
async fn test_token_endpoint() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let (status, body) = get_json(app, "/api/token").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token"], "test-key");
    assert_eq!(body["message"], "Token retrieved successfully");

    let expires_at: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(body["expires_at"].clone()).unwrap();
    assert!(expires_at > chrono::Utc::now());
    assert!(expires_at <= chrono::Utc::now() + chrono::Duration::seconds(31));
}

#[tokio::test]
async fn test_token_endpoint_rejects_bad_scope() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let (status, body) = get_json(app, "/api/token?scope=bad%20scope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn test_token_issuance_failure() {
    let config = test_config("ws://127.0.0.1:9/v1/speak");
    let issuer = Arc::new(StaticKeyIssuer::new("", Duration::from_secs(30)));
    let app = build_router(AppState::with_issuer(config, issuer));

    let (status, body) = get_json(app, "/api/token").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], 500);
    assert!(body["error"].as_str().unwrap().contains("no API key configured"));
}

#[tokio::test]
async fn test_token_endpoint_rate_limited() {
    let config = ServerConfig {
        rate_limit_per_minute: 2,
        ..test_config("ws://127.0.0.1:9/v1/speak")
    };
    let app = create_test_app(config);

    for _ in 0..2 {
        let (status, _) = get_json(app.clone(), "/api/token").await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = get_json(app, "/api/token").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_routes_follow_serve_mode() {
    let relay_only = ServerConfig {
        mode: ServeMode::Relay,
        ..test_config("ws://127.0.0.1:9/v1/speak")
    };
    let (status, _) = get_json(create_test_app(relay_only), "/api/token").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let direct_only = ServerConfig {
        mode: ServeMode::Direct,
        ..test_config("ws://127.0.0.1:9/v1/speak")
    };
    let (status, _) = get_json(create_test_app(direct_only), "/ws").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessions_empty() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let (status, body) = get_json(app, "/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn test_terminate_session_errors() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/sessions/not-a-session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_count_tokens() {
    let app = create_test_app(test_config("ws://127.0.0.1:9/v1/speak"));

    let (status, _) = get_json(app.clone(), "/api/token").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(app, "/api/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens_issued"], 1);
    assert_eq!(body["active_sessions"], 0);
    assert_eq!(body["sessions_started"], 0);
}
