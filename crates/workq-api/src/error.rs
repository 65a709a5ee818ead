//! API error types and JSON error response formatting.
//!
//! ApiError provides a consistent JSON error response format across all
//! endpoints, mapping internal errors to appropriate HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use workq_chat::ChatError;
use workq_core::error::WorkqError;
use workq_provider::ProviderError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400 Bad Request - missing or invalid parameters.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// 401 Unauthorized - missing or unknown session.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// 403 Forbidden - resource owned by another user.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// 404 Not Found - resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// 429 Too Many Requests - message tells the user when to retry.
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    /// 500 - missing credentials or settings; the message says what to set.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// 500 Internal Server Error - details are logged, never returned.
    #[error("internal error: {0}")]
    Internal(String),
    /// 503 Service Unavailable - upstream not reachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg)
            }
            ApiError::Configuration(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error", msg)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred. Please try again.".to_string(),
                )
            }
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<WorkqError> for ApiError {
    fn from(err: WorkqError) -> Self {
        match &err {
            WorkqError::Config(msg) => ApiError::Configuration(msg.clone()),
            WorkqError::NotFound(_) => ApiError::NotFound(err.user_message()),
            WorkqError::Unauthenticated(_) => ApiError::Unauthorized(err.user_message()),
            WorkqError::Forbidden(_) => ApiError::Forbidden(err.user_message()),
            WorkqError::RateLimited { .. } => ApiError::TooManyRequests(err.user_message()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::Configuration(msg) => ApiError::Configuration(msg.clone()),
            _ if err.is_rate_limited() => ApiError::TooManyRequests(err.user_message()),
            _ => ApiError::ServiceUnavailable(err.user_message()),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyQuery | ChatError::MissingUser => ApiError::BadRequest(err.to_string()),
            ChatError::ConversationNotFound(id) => {
                ApiError::NotFound(format!("conversation {} was not found", id))
            }
            ChatError::Forbidden(_) => {
                ApiError::Forbidden("You don't have access to this conversation.".to_string())
            }
            ChatError::Storage(msg) => ApiError::Internal(msg),
            ChatError::Provider(e) => e.into(),
        }
    }
}
