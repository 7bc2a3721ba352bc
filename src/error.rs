use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the analysis cache and its HTTP layer.
///
/// `Clone` because one refresh outcome is handed to every caller that joined
/// the same in-flight ticket. Foreign errors are therefore kept as messages.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalyzerError {
    /// The durable store has no analysis for this key. Never cached.
    #[error("analysis not found: {0}")]
    NotFound(String),

    /// The cache backend could not be reached or answered with an error.
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The refresh computation failed; every waiter on the ticket sees this.
    #[error("computation failed for {key}: {reason}")]
    Computation { key: String, reason: String },

    /// The caller's deadline elapsed while waiting on a refresh.
    #[error("timed out after {}ms waiting for {key}", .after.as_millis())]
    Timeout { key: String, after: Duration },

    /// The durable store failed; surfaced verbatim.
    #[error("store error: {0}")]
    Store(String),

    #[error("invalid analysis key: {0}")]
    InvalidKey(String),

    /// A well-formed request whose values are out of range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An entry could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl AnalyzerError {
    pub fn computation(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Computation {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Computation { .. } => "computation_failed",
            Self::Timeout { .. } => "timeout",
            Self::Store(_) => "store_error",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Codec(_) => "codec_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Computation { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidKey(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalyzerError>;

impl IntoResponse for AnalyzerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AnalyzerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

#[cfg(feature = "valkey")]
impl From<redis::RedisError> for AnalyzerError {
    fn from(e: redis::RedisError) -> Self {
        Self::BackendUnavailable(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for AnalyzerError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for AnalyzerError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Store(format!("connection pool: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AnalyzerError::NotFound("k".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AnalyzerError::Timeout {
                key: "k".into(),
                after: Duration::from_millis(5)
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AnalyzerError::computation("k", "boom").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AnalyzerError::InvalidKey("".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AnalyzerError::InvalidRequest("too many keys".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn timeout_message_includes_millis() {
        let err = AnalyzerError::Timeout {
            key: "abc".into(),
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "timed out after 250ms waiting for abc");
    }

    #[test]
    fn json_error_maps_to_codec() {
        let err: AnalyzerError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "codec_error");
    }
}
