use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{delete, get},
    Json, Router,
};
use provider_core::TokenResponse;
use serde::{Deserialize, Serialize};
use stream_core::Session;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::MetricsResponse;
use crate::relay::relay_ws;
use crate::state::AppState;
use crate::validation::{validate_session_id, validate_token_scope};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub approach: &'static str,
}

#[derive(Deserialize)]
pub struct TokenQuery {
    scope: Option<String>,
}

#[derive(Serialize)]
pub struct TerminateResponse {
    pub session_id: Uuid,
    pub terminated: bool,
}

/// Assemble the application for the configured serve mode.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut api = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", delete(terminate_session))
        .route("/metrics", get(metrics_endpoint));
    if config.mode.serves_direct() {
        api = api.merge(token_routes(&config));
    }

    let mut app = Router::new().route("/health", get(health_check)).nest("/api", api);
    if config.mode.serves_relay() {
        app = app.route("/ws", get(relay_ws));
    }
    info!(mode = ?config.mode, "Routes mounted");

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(&config))
        .into_inner();

    app.layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state)
}

// Rate limiting applies to credential issuance only; the relay and the
// operational endpoints are not limited.
fn token_routes(config: &ServerConfig) -> Router<AppState> {
    let routes = Router::new().route("/token", get(issue_token));
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = GovernorConfigBuilder::default()
        .per_millisecond(60_000 / per_minute as u64)
        .burst_size(per_minute)
        .key_extractor(GlobalKeyExtractor)
        .finish();
    match governor_conf {
        Some(conf) => {
            info!("Token rate limiting: {} requests per minute", per_minute);
            routes.layer(GovernorLayer::new(Arc::new(conf)))
        }
        None => {
            warn!("Invalid rate limit configuration; token endpoint is not rate limited");
            routes
        }
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::DELETE, Method::OPTIONS];
    let permissive = || {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods.clone())
            .allow_headers(Any)
            .allow_credentials(false)
    };

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return permissive();
    };
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        return permissive();
    }
    info!("CORS configured for {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(Any)
        .allow_credentials(false)
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert("x-request-id", value);
        return response;
    }
    next.run(request).await
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        approach: state.config.mode.approach(),
    })
}

/// Hand the browser a short-lived provider credential.
pub async fn issue_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenResponse>, ApiError> {
    let scope = validate_token_scope(query.scope.as_deref())?;
    let credential = state.issuer.issue_token(scope).await?;
    state.metrics.record_token_issued();
    Ok(Json(TokenResponse {
        token: credential.token,
        expires_at: credential.expires_at,
        message: Some("Token retrieved successfully".to_string()),
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.registry.snapshot().await)
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TerminateResponse>, ApiError> {
    let session_id = validate_session_id(&id)?;
    if !state.registry.terminate(session_id).await {
        return Err(ApiError::NotFound(format!("No active session {}", session_id)));
    }
    Ok(Json(TerminateResponse {
        session_id,
        terminated: true,
    }))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let active = state.registry.len().await;
    Json(state.metrics.snapshot(active))
}
