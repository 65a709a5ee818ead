//! Shared domain types for the query pipeline, conversation store and API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Conversations
// =============================================================================

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A conversation owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    /// Email of the owning user.
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u64,
    pub model: Option<String>,
    pub total_tokens: u64,
    pub last_message_preview: Option<String>,
    pub metadata: serde_json::Value,
}

impl Conversation {
    /// Whether `email` owns this conversation.
    pub fn is_owned_by(&self, email: &str) -> bool {
        self.user_id == email
    }
}

/// A single immutable message in a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Partial update applied by `update_conversation`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub model: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Summary statistics for a conversation's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    pub conversation_id: Uuid,
    pub title: String,
    pub message_count: u64,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
}

impl From<&Conversation> for ContextStats {
    fn from(c: &Conversation) -> Self {
        Self {
            conversation_id: c.id,
            title: c.title.clone(),
            message_count: c.message_count,
            total_tokens: c.total_tokens,
            created_at: c.created_at,
            updated_at: c.updated_at,
            last_message_preview: c.last_message_preview.clone(),
        }
    }
}

/// A usage counter for one (operation, identity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub key: String,
    pub count: u32,
    pub window_expiry: DateTime<Utc>,
}

// =============================================================================
// Reference data
// =============================================================================

/// The closed set of organization-wide reference-data categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Sprints,
    Users,
    States,
    Types,
    Tags,
    Queries,
    Projects,
    Teams,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Sprints,
        EntityKind::Users,
        EntityKind::States,
        EntityKind::Types,
        EntityKind::Tags,
        EntityKind::Queries,
        EntityKind::Projects,
        EntityKind::Teams,
    ];

    /// Key used for this category in JSON payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sprints => "sprints",
            EntityKind::Users => "users",
            EntityKind::States => "states",
            EntityKind::Types => "types",
            EntityKind::Tags => "tags",
            EntityKind::Queries => "queries",
            EntityKind::Projects => "projects",
            EntityKind::Teams => "teams",
        }
    }

    /// Singular noun used in generated prose.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Sprints => "sprint",
            EntityKind::Users => "user",
            EntityKind::States => "state",
            EntityKind::Types => "work item type",
            EntityKind::Tags => "tag",
            EntityKind::Queries => "saved query",
            EntityKind::Projects => "project",
            EntityKind::Teams => "team",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower || k.as_str().trim_end_matches('s') == lower)
            .ok_or_else(|| format!("unknown entity kind: {}", s))
    }
}

/// Relative position of a sprint against today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFrame {
    Past,
    Current,
    Future,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub name: String,
    pub path: String,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub time_frame: Option<TimeFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerUser {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemState {
    pub name: String,
    /// Tracker-side category such as "Proposed", "InProgress", "Completed".
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemType {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQuery {
    pub id: String,
    pub name: String,
    pub path: String,
    pub wiql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

/// Organization-wide reference data, replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSnapshot {
    pub sprints: Vec<Sprint>,
    pub users: Vec<TrackerUser>,
    pub states: Vec<WorkItemState>,
    pub types: Vec<WorkItemType>,
    pub tags: Vec<Tag>,
    pub queries: Vec<SavedQuery>,
    pub projects: Vec<Project>,
    pub teams: Vec<Team>,
    pub last_updated: DateTime<Utc>,
}

impl MetadataSnapshot {
    /// Number of entries in one category.
    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Sprints => self.sprints.len(),
            EntityKind::Users => self.users.len(),
            EntityKind::States => self.states.len(),
            EntityKind::Types => self.types.len(),
            EntityKind::Tags => self.tags.len(),
            EntityKind::Queries => self.queries.len(),
            EntityKind::Projects => self.projects.len(),
            EntityKind::Teams => self.teams.len(),
        }
    }

    /// Entry counts for every category, keyed by category name.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        EntityKind::ALL
            .into_iter()
            .map(|k| (k.as_str().to_string(), self.count(k)))
            .collect()
    }

    /// Display names of the entries in one category.
    pub fn names(&self, kind: EntityKind) -> Vec<String> {
        match kind {
            EntityKind::Sprints => self.sprints.iter().map(|s| s.name.clone()).collect(),
            EntityKind::Users => self.users.iter().map(|u| u.display_name.clone()).collect(),
            EntityKind::States => self.states.iter().map(|s| s.name.clone()).collect(),
            EntityKind::Types => self.types.iter().map(|t| t.name.clone()).collect(),
            EntityKind::Tags => self.tags.iter().map(|t| t.name.clone()).collect(),
            EntityKind::Queries => self.queries.iter().map(|q| q.name.clone()).collect(),
            EntityKind::Projects => self.projects.iter().map(|p| p.name.clone()).collect(),
            EntityKind::Teams => self.teams.iter().map(|t| t.name.clone()).collect(),
        }
    }

    /// One category serialized as a JSON array.
    pub fn collection_json(&self, kind: EntityKind) -> serde_json::Value {
        let value = match kind {
            EntityKind::Sprints => serde_json::to_value(&self.sprints),
            EntityKind::Users => serde_json::to_value(&self.users),
            EntityKind::States => serde_json::to_value(&self.states),
            EntityKind::Types => serde_json::to_value(&self.types),
            EntityKind::Tags => serde_json::to_value(&self.tags),
            EntityKind::Queries => serde_json::to_value(&self.queries),
            EntityKind::Projects => serde_json::to_value(&self.projects),
            EntityKind::Teams => serde_json::to_value(&self.teams),
        };
        value.unwrap_or_else(|_| serde_json::Value::Array(vec![]))
    }

    /// The sprint the tracker marks as current, if any.
    pub fn current_sprint(&self) -> Option<&Sprint> {
        self.sprints
            .iter()
            .find(|s| s.time_frame == Some(TimeFrame::Current))
    }
}

/// Counts and freshness of the cached snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataStats {
    pub cached: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub counts: BTreeMap<String, usize>,
}

// =============================================================================
// Work items and query analysis
// =============================================================================

/// A trackable unit (bug, task, story, ...) in the work-tracking backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub state: String,
    pub item_type: String,
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Option<u8>,
    pub iteration_path: Option<String>,
    pub parent_id: Option<u64>,
    pub changed_date: Option<DateTime<Utc>>,
    pub url: Option<String>,
    /// Full-text relevance score, only set by enhanced mode.
    pub relevance: Option<f32>,
}

/// Structured search derived from a free-text query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchCriteria {
    /// Reference-data category the query targets; `None` means work items.
    pub entity_kind: Option<EntityKind>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub tags: Vec<String>,
    pub assignee: Option<String>,
    pub free_text: Option<String>,
    pub priority: Option<u8>,
    /// Sprint or relative time frame ("current sprint", "last sprint").
    pub timeframe: Option<String>,
}

impl SearchCriteria {
    /// Whether no filter at all is set.
    pub fn is_empty(&self) -> bool {
        self.entity_kind.is_none()
            && self.status.is_none()
            && self.item_type.is_none()
            && self.tags.is_empty()
            && self.assignee.is_none()
            && self.free_text.is_none()
            && self.priority.is_none()
            && self.timeframe.is_none()
    }

    /// Whether any work-item filter is set. Free text alone does not count.
    pub fn has_item_filters(&self) -> bool {
        self.status.is_some()
            || self.item_type.is_some()
            || !self.tags.is_empty()
            || self.assignee.is_some()
            || self.priority.is_some()
            || self.timeframe.is_some()
    }

    /// Replace a self reference ("@me", "me", "myself", "mine") in the assignee
    /// with the asking user's identity.
    pub fn resolve_self_reference(&mut self, user_id: &str) {
        let is_self = self.assignee.as_deref().is_some_and(|a| {
            matches!(a.trim().to_lowercase().as_str(), "@me" | "me" | "myself" | "mine")
        });
        if is_self {
            self.assignee = Some(user_id.to_string());
        }
    }

    /// Fill unset fields from request-level filters.
    pub fn apply_filters(&mut self, filters: &GlobalFilters) {
        if self.assignee.is_none() {
            self.assignee = filters.assignee.clone();
        }
        if self.status.is_none() {
            self.status = filters.states.first().cloned();
        }
        if self.item_type.is_none() {
            self.item_type = filters.types.first().cloned();
        }
        if self.timeframe.is_none() {
            self.timeframe = filters.iteration.clone();
        }
        for tag in &filters.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }
}

/// Output of intent analysis. Produced once per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub needs_backend_data: bool,
    #[serde(default)]
    pub search_criteria: Option<SearchCriteria>,
    pub intent: String,
    #[serde(default)]
    pub requires_summary: bool,
}

/// Request-level filters selected outside the query text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalFilters {
    pub project: Option<String>,
    pub team: Option<String>,
    pub iteration: Option<String>,
    pub assignee: Option<String>,
    pub states: Vec<String>,
    pub types: Vec<String>,
    pub tags: Vec<String>,
}

/// Per-request pipeline switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub skip_cache: bool,
    pub verbose: bool,
}

/// Which access mode served a backend fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSource {
    Enhanced,
    Rest,
}

impl BackendSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendSource::Enhanced => "enhanced",
            BackendSource::Rest => "rest",
        }
    }
}

impl fmt::Display for BackendSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Orchestrator result
// =============================================================================

/// Pipeline stage names used in metrics and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CollectionDetection,
    IntentAnalysis,
    Retrieval,
    Synthesis,
    Persistence,
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    FellBack,
    Failed,
    Skipped,
}

impl StageOutcome {
    /// Contribution of this outcome to the confidence score.
    /// `None` for stages that did not run.
    pub fn weight(&self) -> Option<f32> {
        match self {
            StageOutcome::Succeeded => Some(1.0),
            StageOutcome::FellBack => Some(0.5),
            StageOutcome::Failed => Some(0.0),
            StageOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownPoint {
    pub label: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyNode {
    pub id: u64,
    pub title: String,
    pub item_type: String,
    pub children: Vec<HierarchyNode>,
}

/// Chart-ready data derived from retrieved items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Visualization {
    Breakdown {
        title: String,
        dimension: String,
        points: Vec<BreakdownPoint>,
    },
    Hierarchy {
        title: String,
        roots: Vec<HierarchyNode>,
    },
}

/// Aggregate pipeline metrics attached to every result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub queries_executed: u32,
    pub data_sources: Vec<String>,
    pub confidence: f32,
    /// Wall-clock processing time in milliseconds.
    pub processing_time: u64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageReport>>,
}

/// The response of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorResult {
    pub success: bool,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<QueryAnalysis>,
    #[serde(default)]
    pub insights: Vec<String>,
    pub raw_data: Vec<serde_json::Value>,
    pub suggestions: Vec<String>,
    pub visualizations: Vec<Visualization>,
    pub metadata: ResultMetadata,
    pub conversation_id: Option<Uuid>,
}

/// Suggestions offered whenever the pipeline cannot answer.
pub const DEFAULT_SUGGESTIONS: [&str; 3] = [
    "Show my active work items",
    "List all projects",
    "What bugs were updated this week?",
];

impl OrchestratorResult {
    /// A well-formed failure payload with safe fallback suggestions.
    pub fn fallback(summary: impl Into<String>, conversation_id: Option<Uuid>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            analysis: None,
            insights: vec![],
            raw_data: vec![],
            suggestions: DEFAULT_SUGGESTIONS.iter().map(|s| s.to_string()).collect(),
            visualizations: vec![],
            metadata: ResultMetadata::default(),
            conversation_id,
        }
    }
}
