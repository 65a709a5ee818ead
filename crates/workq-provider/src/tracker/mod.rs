//! Work-tracker access modes.
//!
//! Two interchangeable backends implement [`WorkItemBackend`]: the plain
//! REST mode (universal baseline) and the enhanced mode, which adds
//! sprint/time-frame resolution and relevance ranking. Reference data is
//! read through [`MetadataSource`], which the REST mode implements.

mod enhanced;
mod rest;
pub mod wiql;

pub use enhanced::EnhancedTracker;
pub use rest::RestTracker;

use async_trait::async_trait;

use workq_core::types::{
    BackendSource, Project, SavedQuery, SearchCriteria, Sprint, Tag, Team, TrackerUser,
    WorkItem, WorkItemState, WorkItemType,
};

use crate::backoff::Deadline;
use crate::error::ProviderError;

/// One data-access mode for work items.
#[async_trait]
pub trait WorkItemBackend: Send + Sync {
    fn source(&self) -> BackendSource;

    /// Whether this mode can serve requests right now.
    async fn probe(&self, deadline: &Deadline) -> bool;

    async fn search(
        &self,
        criteria: &SearchCriteria,
        deadline: &Deadline,
    ) -> Result<Vec<WorkItem>, ProviderError>;
}

/// Organization-wide reference data, one call per category.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn sprints(&self, deadline: &Deadline) -> Result<Vec<Sprint>, ProviderError>;
    async fn users(&self, deadline: &Deadline) -> Result<Vec<TrackerUser>, ProviderError>;
    async fn states(&self, deadline: &Deadline) -> Result<Vec<WorkItemState>, ProviderError>;
    async fn types(&self, deadline: &Deadline) -> Result<Vec<WorkItemType>, ProviderError>;
    async fn tags(&self, deadline: &Deadline) -> Result<Vec<Tag>, ProviderError>;
    async fn queries(&self, deadline: &Deadline) -> Result<Vec<SavedQuery>, ProviderError>;
    async fn projects(&self, deadline: &Deadline) -> Result<Vec<Project>, ProviderError>;
    async fn teams(&self, deadline: &Deadline) -> Result<Vec<Team>, ProviderError>;
}
