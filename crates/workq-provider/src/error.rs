//! Error types for outbound provider and tracker calls.

use std::time::Duration;

use workq_core::error::{retry_after_phrase, WorkqError};

/// Retry classification attached to every failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// HTTP 429. `retry_after` comes from the `Retry-After` header when sent.
    RateLimited { retry_after: Option<Duration> },
    /// Timeouts, connection failures and 5xx responses.
    Transient,
    /// Any other 4xx, malformed requests, unusable responses.
    Permanent,
}

impl ErrorClass {
    /// Classify a non-2xx HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ErrorClass::RateLimited { retry_after },
            408 | 500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

/// Errors from the provider crate.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{service} returned HTTP {status}: {message}")]
    Upstream {
        service: String,
        status: u16,
        class: ErrorClass,
        message: String,
    },
    #[error("request to {service} failed: {message}")]
    Transport { service: String, message: String },
    #[error("invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },
    #[error("deadline exceeded while calling {0}")]
    DeadlineExceeded(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    pub fn invalid_response(service: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// The retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Upstream { class, .. } => *class,
            ProviderError::Transport { .. } | ProviderError::DeadlineExceeded(_) => {
                ErrorClass::Transient
            }
            ProviderError::InvalidResponse { .. } | ProviderError::Configuration(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.class(), ErrorClass::RateLimited { .. })
    }

    /// Seconds the upstream asked us to wait, if this is a rate-limit error.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.class() {
            ErrorClass::RateLimited { retry_after } => {
                Some(retry_after.map(|d| d.as_secs()).unwrap_or(60))
            }
            _ => None,
        }
    }

    /// Message safe to show to an end user. Never includes upstream bodies.
    pub fn user_message(&self) -> String {
        if let Some(secs) = self.retry_after_secs() {
            return format!(
                "The service is receiving too many requests. {}.",
                retry_after_phrase(secs)
            );
        }
        match self {
            ProviderError::Configuration(msg) => msg.clone(),
            ProviderError::DeadlineExceeded(_) => {
                "The request took too long to complete. Please try again.".to_string()
            }
            _ => "An upstream service is unavailable right now. Please try again.".to_string(),
        }
    }
}

impl From<WorkqError> for ProviderError {
    fn from(err: WorkqError) -> Self {
        match err {
            WorkqError::Config(msg) => ProviderError::Configuration(msg),
            other => ProviderError::Configuration(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(
            ErrorClass::from_status(429, None),
            ErrorClass::RateLimited { retry_after: None }
        );
        assert_eq!(ErrorClass::from_status(500, None), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(503, None), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(408, None), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_status(400, None), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_status(401, None), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_status(404, None), ErrorClass::Permanent);
    }

    #[test]
    fn test_only_permanent_is_not_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::RateLimited { retry_after: None }.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
    }

    #[test]
    fn test_rate_limited_user_message() {
        let err = ProviderError::Upstream {
            service: "openai".into(),
            status: 429,
            class: ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(150)),
            },
            message: "{\"error\":\"slow down\"}".into(),
        };
        let msg = err.user_message();
        assert!(msg.contains("Try again in 3 minutes"), "got: {msg}");
        assert!(!msg.contains("slow down"));
    }

    #[test]
    fn test_rate_limited_without_header_defaults_to_a_minute() {
        let err = ProviderError::Upstream {
            service: "tracker".into(),
            status: 429,
            class: ErrorClass::RateLimited { retry_after: None },
            message: String::new(),
        };
        assert_eq!(err.retry_after_secs(), Some(60));
        assert!(err.user_message().contains("Try again in 1 minute"));
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let err = ProviderError::Transport {
            service: "tracker".into(),
            message: "connection reset".into(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.user_message().contains("connection reset"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: ProviderError = WorkqError::Config("Set WORKQ_TRACKER_TOKEN".into()).into();
        assert!(matches!(err, ProviderError::Configuration(_)));
        assert_eq!(err.user_message(), "Set WORKQ_TRACKER_TOKEN");
    }
}
