//! Error types for the query pipeline.

use uuid::Uuid;
use workq_core::error::WorkqError;
use workq_provider::ProviderError;

/// Errors from the chat pipeline.
///
/// Only input, ownership and storage problems escape
/// [`QueryOrchestrator::process`](crate::QueryOrchestrator::process); every
/// upstream failure is absorbed into a well-formed result.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("query cannot be empty")]
    EmptyQuery,
    #[error("user id is required")]
    MissingUser,
    #[error("conversation not found: {0}")]
    ConversationNotFound(Uuid),
    #[error("conversation {0} belongs to another user")]
    Forbidden(Uuid),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<WorkqError> for ChatError {
    fn from(err: WorkqError) -> Self {
        ChatError::Storage(err.to_string())
    }
}
