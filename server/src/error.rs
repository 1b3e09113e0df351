use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use stream_core::StreamError;
use thiserror::Error;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

fn stream_status(err: &StreamError) -> StatusCode {
    match err {
        StreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        StreamError::UpstreamUnavailable(_)
        | StreamError::UpstreamInterrupted { .. }
        | StreamError::UpstreamTimeout(_) => StatusCode::BAD_GATEWAY,
        StreamError::SessionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StreamError::QueueOverflow { .. } | StreamError::DeliveryFailed(_) | StreamError::IssuanceFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Stream(e) => {
                let status = stream_status(&e);
                if status.is_server_error() {
                    tracing::error!(code = e.code(), "Stream error: {}", e);
                }
                (status, e.to_string())
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuance_failure_is_internal_error() {
        let response = ApiError::from(StreamError::IssuanceFailed("no key".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(StreamError::InvalidRequest("empty".into())).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StreamError::UpstreamUnavailable("refused".into())).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::NotFound("session".into()).into_response().status(), StatusCode::NOT_FOUND);
    }
}
