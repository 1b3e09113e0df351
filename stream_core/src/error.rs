use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by every stage of the relay.
///
/// Errors travel in-band: they are cloned into the relay queue as its terminal
/// item and serialized onto the client channel with [`StreamError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream interrupted after {frames} frame(s): {reason}")]
    UpstreamInterrupted { frames: u64, reason: String },

    #[error("Upstream timed out after {0:?} without audio or completion")]
    UpstreamTimeout(Duration),

    #[error("Queue overflow: {buffered} bytes buffered, ceiling is {ceiling} bytes")]
    QueueOverflow { buffered: usize, ceiling: usize },

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Session timed out after {0:?} of inactivity")]
    SessionTimeout(Duration),

    #[error("Credential issuance failed: {0}")]
    IssuanceFailed(String),
}

impl StreamError {
    /// Stable identifier used in `error` control messages.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::InvalidRequest(_) => "invalid_request",
            StreamError::UpstreamUnavailable(_) => "upstream_unavailable",
            StreamError::UpstreamInterrupted { .. } => "upstream_interrupted",
            StreamError::UpstreamTimeout(_) => "upstream_timeout",
            StreamError::QueueOverflow { .. } => "queue_overflow",
            StreamError::DeliveryFailed(_) => "delivery_failed",
            StreamError::SessionTimeout(_) => "session_timeout",
            StreamError::IssuanceFailed(_) => "issuance_failed",
        }
    }

    /// Only a connection that never came up is worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::UpstreamUnavailable(_))
    }

    /// Rebuild an error from a wire `code` and `message` pair.
    ///
    /// Structured fields (frame counts, durations) do not survive the trip; the
    /// message text is kept instead.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "invalid_request" => StreamError::InvalidRequest(message),
            "upstream_unavailable" => StreamError::UpstreamUnavailable(message),
            "upstream_interrupted" => StreamError::UpstreamInterrupted {
                frames: 0,
                reason: message,
            },
            "upstream_timeout" => StreamError::UpstreamTimeout(Duration::ZERO),
            "queue_overflow" => StreamError::QueueOverflow {
                buffered: 0,
                ceiling: 0,
            },
            "session_timeout" => StreamError::SessionTimeout(Duration::ZERO),
            "issuance_failed" => StreamError::IssuanceFailed(message),
            _ => StreamError::DeliveryFailed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StreamError::UpstreamUnavailable("refused".into()).is_retryable());
        assert!(!StreamError::UpstreamInterrupted {
            frames: 2,
            reason: "reset".into()
        }
        .is_retryable());
        assert!(!StreamError::InvalidRequest("empty".into()).is_retryable());
        assert!(!StreamError::UpstreamTimeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_wire_codes_round_trip_variant() {
        let errors = [
            StreamError::InvalidRequest("x".into()),
            StreamError::UpstreamUnavailable("x".into()),
            StreamError::UpstreamInterrupted {
                frames: 1,
                reason: "x".into(),
            },
            StreamError::UpstreamTimeout(Duration::from_secs(3)),
            StreamError::QueueOverflow {
                buffered: 10,
                ceiling: 8,
            },
            StreamError::DeliveryFailed("x".into()),
            StreamError::SessionTimeout(Duration::from_secs(60)),
            StreamError::IssuanceFailed("x".into()),
        ];
        for err in errors {
            let rebuilt = StreamError::from_wire(err.code(), err.to_string());
            assert_eq!(rebuilt.code(), err.code());
        }
    }
}
