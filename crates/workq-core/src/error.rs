use thiserror::Error;

/// Top-level error type for workq.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for WorkqError` (or the reverse) so that `?`
/// works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded for {operation}")]
    RateLimited {
        operation: String,
        retry_after_secs: u64,
    },
}

impl WorkqError {
    /// Human-readable message safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            WorkqError::RateLimited {
                retry_after_secs, ..
            } => format!(
                "You're sending requests too quickly. {}.",
                retry_after_phrase(*retry_after_secs)
            ),
            WorkqError::Config(msg) => msg.clone(),
            WorkqError::NotFound(what) => format!("{} was not found", what),
            WorkqError::Unauthenticated(_) => "Please sign in again.".to_string(),
            WorkqError::Forbidden(_) => "You don't have access to this resource.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<toml::de::Error> for WorkqError {
    fn from(err: toml::de::Error) -> Self {
        WorkqError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for WorkqError {
    fn from(err: toml::ser::Error) -> Self {
        WorkqError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WorkqError {
    fn from(err: serde_json::Error) -> Self {
        WorkqError::Serialization(err.to_string())
    }
}

/// Render a retry-after delay as "Try again in N minutes".
///
/// Rounds up to whole minutes with a floor of one minute.
pub fn retry_after_phrase(secs: u64) -> String {
    let minutes = secs.div_ceil(60).max(1);
    if minutes == 1 {
        "Try again in 1 minute".to_string()
    } else {
        format!("Try again in {} minutes", minutes)
    }
}

/// A specialized `Result` type for workq operations.
pub type Result<T> = std::result::Result<T, WorkqError>;
