//! Application state shared across all route handlers.
//!
//! AppState holds references to the orchestrator and the stores it was
//! built from. It is passed to handlers via axum's State extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use workq_chat::{MetadataCache, QueryOrchestrator};
use workq_core::config::WorkqConfig;
use workq_provider::Deadline;
use workq_storage::{ConversationStore, RateLimitStore};

/// Shared application state.
///
/// All fields use `Arc` for cheap cloning across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration, including the session table.
    pub config: Arc<WorkqConfig>,
    pub orchestrator: Arc<QueryOrchestrator>,
    pub rate_limits: Arc<RateLimitStore>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: WorkqConfig,
        orchestrator: Arc<QueryOrchestrator>,
        rate_limits: Arc<RateLimitStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            rate_limits,
            start_time: Instant::now(),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        self.orchestrator.store()
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        self.orchestrator.metadata()
    }

    /// Deadline for a handler that talks to the tracker directly.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(Duration::from_secs(
            self.config.orchestrator.request_timeout_secs,
        ))
    }
}
