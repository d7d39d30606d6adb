use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while building limiters or talking to the shared datastore.
///
/// Admission itself never fails; these only surface from construction,
/// configuration and datastore adapters.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Datastore error: {0}")]
    Datastore(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::Redis(err.to_string())
    }
}

impl From<validator::ValidationErrors> for LimiterError {
    fn from(err: validator::ValidationErrors) -> Self {
        LimiterError::ValidationError(err.to_string())
    }
}

pub type LimiterResult<T> = Result<T, LimiterError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_limiter_error(err: &LimiterError) -> Self {
        match err {
            LimiterError::Redis(msg) => Self::new("service_unavailable", msg, 503),
            LimiterError::Datastore(msg) => Self::new("service_unavailable", msg, 503),
            LimiterError::Configuration(msg) => Self::new("configuration_error", msg, 500),
            LimiterError::ValidationError(msg) => Self::new("validation_error", msg, 422),
            LimiterError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_limiter_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LimiterError::Datastore("connection refused".to_string());
        assert_eq!(err.to_string(), "Datastore error: connection refused");

        let err = LimiterError::ValidationError("window size must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: window size must be greater than 0"
        );
    }

    #[test]
    fn test_error_response_codes() {
        let err = LimiterError::ValidationError("limit must be at least 1".to_string());
        let body = ErrorResponse::from_limiter_error(&err);
        assert_eq!(body.code, 422);
        assert_eq!(body.error, "validation_error");

        let response = LimiterError::Datastore("down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_from_redis_error() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "broken pipe"));
        let err: LimiterError = redis_err.into();
        assert!(matches!(err, LimiterError::Redis(msg) if msg.contains("broken pipe")));
    }
}
