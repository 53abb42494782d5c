use axum::{http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

/// The only error shape allowed to cross the HTTP boundary. Components
/// report failures as `ApiError` directly (or as a bare `String` for the
/// few internal paths that never reach a handler) rather than through
/// their own error enums, so there is exactly one shape to convert to
/// `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("queue full: {0}")]
    QueueFull(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    /// Raised internally when a resilience breaker is open. Never returned
    /// from a handler directly — callers translate it into a fallback
    /// response or a `ServiceUnavailable` before it reaches the HTTP layer.
    #[error("circuit open: {0}")]
    CircuitOpen(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ApiError::Validation(vec![format!("{}: {}", field.into(), reason.into())])
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::QueueFull(_) => "QUEUE_FULL",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::CircuitOpen(_) => "SERVICE_UNAVAILABLE",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = match &self {
            ApiError::Validation(fields) => fields.join("; "),
            ApiError::NotFound(msg)
            | ApiError::QueueFull(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg)
            | ApiError::CircuitOpen(msg) => msg.clone(),
        };

        let body = Json(json!({
            "error": { "code": self.code(), "message": message },
            "timestamp": Utc::now().to_rfc3339(),
        }));
        (status, body).into_response()
    }
}
