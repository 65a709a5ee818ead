//! workq provider crate - resilient outbound calls.
//!
//! Everything that leaves the process goes through here: the backoff
//! policy and deadline, the resilient HTTP client with error
//! classification, the language-model providers and their fallback chain,
//! and the two work-tracker access modes (REST and enhanced).

pub mod backoff;
pub mod client;
pub mod error;
pub mod llm;
pub mod tracker;

pub use backoff::{BackoffPolicy, Deadline};
pub use client::{ProviderResponse, RequestSpec, ResilientClient};
pub use error::{ErrorClass, ProviderError};
pub use llm::{ChatTurn, Completion, CompletionRequest, LlmProvider, ProviderChain};
pub use tracker::{EnhancedTracker, MetadataSource, RestTracker, WorkItemBackend};
