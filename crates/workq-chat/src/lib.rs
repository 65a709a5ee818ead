//! Query orchestration pipeline for workq.
//!
//! Turns a free-text question into a retrieval plan, runs it against the
//! work tracker and synthesizes an answer, recording the exchange in the
//! conversation store.

pub mod collection;
pub mod error;
pub mod extract;
pub mod intent;
pub mod metadata;
pub mod orchestrator;
pub mod result_cache;
pub mod selector;
pub mod synthesis;
pub mod visualize;

pub use collection::{CollectionDetector, CollectionMatch, Confidence};
pub use error::ChatError;
pub use intent::IntentAnalyzer;
pub use metadata::MetadataCache;
pub use orchestrator::{QueryOrchestrator, QueryRequest};
pub use result_cache::ResultCache;
pub use selector::{Availability, BackendSelector, FetchOutcome};
pub use synthesis::Synthesizer;
