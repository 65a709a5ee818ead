//! REST access mode.
//!
//! Work items are found with a WIQL query and then loaded in batches of
//! at most [`BATCH_SIZE`] ids. Reference data comes from the work, core
//! and work-item-tracking endpoints. All calls authenticate with HTTP
//! Basic auth using the personal access token.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use workq_core::config::TrackerConfig;
use workq_core::types::{
    BackendSource, Project, SavedQuery, SearchCriteria, Sprint, Tag, Team, TimeFrame,
    TrackerUser, WorkItem, WorkItemState, WorkItemType,
};

use super::wiql::{build_query, ITEM_FIELDS};
use super::{MetadataSource, WorkItemBackend};
use crate::backoff::Deadline;
use crate::client::{RequestSpec, ResilientClient};
use crate::error::ProviderError;

const SERVICE: &str = "tracker";

/// Largest id list accepted by the batch endpoint.
pub const BATCH_SIZE: usize = 200;

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WiqlResponse {
    #[serde(default)]
    work_items: Vec<WiqlReference>,
}

#[derive(Debug, Deserialize)]
struct WiqlReference {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RawWorkItem {
    id: u64,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIteration {
    id: String,
    name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    attributes: Option<RawIterationAttributes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIterationAttributes {
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    finish_date: Option<DateTime<Utc>>,
    #[serde(default)]
    time_frame: Option<TimeFrame>,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    identity: RawIdentity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIdentity {
    id: String,
    display_name: String,
    #[serde(default)]
    unique_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWorkItemType {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    states: Vec<RawState>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    name: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueryNode {
    id: String,
    name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    is_folder: bool,
    #[serde(default)]
    wiql: Option<String>,
    #[serde(default)]
    children: Vec<RawQueryNode>,
}

#[derive(Debug, Deserialize)]
struct RawNamed {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

/// REST client for the work tracker.
pub struct RestTracker {
    client: Arc<ResilientClient>,
    config: TrackerConfig,
    max_retries: u32,
    max_items: usize,
}

impl RestTracker {
    pub fn new(client: Arc<ResilientClient>, config: TrackerConfig, max_retries: u32) -> Self {
        Self {
            client,
            config,
            max_retries,
            max_items: BATCH_SIZE,
        }
    }

    /// Cap on items loaded per search.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    fn org_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.organization
        )
    }

    fn project_url(&self) -> String {
        format!("{}/{}", self.org_url(), self.config.project)
    }

    fn team_name(&self) -> String {
        if self.config.team.trim().is_empty() {
            format!("{} Team", self.config.project)
        } else {
            self.config.team.clone()
        }
    }

    fn team_url(&self) -> String {
        format!("{}/{}", self.project_url(), self.team_name())
    }

    fn authorize(&self, spec: RequestSpec) -> RequestSpec {
        let credentials = STANDARD.encode(format!(":{}", self.config.token));
        spec.header("Authorization", format!("Basic {}", credentials))
            .query("api-version", self.config.api_version.clone())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
        deadline: &Deadline,
    ) -> Result<T, ProviderError> {
        self.config.validate()?;
        let response = self
            .client
            .call(&self.authorize(spec), self.max_retries, deadline)
            .await?;
        serde_json::from_value(response.body)
            .map_err(|e| ProviderError::invalid_response(SERVICE, e.to_string()))
    }

    /// Run a WIQL query and return the matching ids in query order.
    pub async fn run_wiql(
        &self,
        wiql: &str,
        deadline: &Deadline,
    ) -> Result<Vec<u64>, ProviderError> {
        let spec = RequestSpec::post(
            SERVICE,
            format!("{}/_apis/wit/wiql", self.team_url()),
            json!({ "query": wiql }),
        )
        .query("$top", self.max_items.to_string())
        .idempotent(true);

        let response: WiqlResponse = self.get_json(spec, deadline).await?;
        Ok(response.work_items.into_iter().map(|w| w.id).collect())
    }

    /// Load full work items for `ids`, preserving the order of `ids`.
    pub async fn fetch_items(
        &self,
        ids: &[u64],
        deadline: &Deadline,
    ) -> Result<Vec<WorkItem>, ProviderError> {
        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            let spec = RequestSpec::post(
                SERVICE,
                format!("{}/_apis/wit/workitemsbatch", self.project_url()),
                json!({ "ids": chunk, "fields": ITEM_FIELDS }),
            )
            .idempotent(true);
            let batch: ValueList<RawWorkItem> = self.get_json(spec, deadline).await?;
            items.extend(batch.value.into_iter().map(work_item_from_raw));
        }

        items.sort_by_key(|item| ids.iter().position(|id| *id == item.id));
        Ok(items)
    }
}

fn field_str(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Identity fields are objects in current API versions and plain strings
/// in older ones.
fn identity_name(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("displayName")
            .or_else(|| map.get("uniqueName"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn work_item_from_raw(raw: RawWorkItem) -> WorkItem {
    let fields = &raw.fields;
    WorkItem {
        id: raw.id,
        title: field_str(fields, "System.Title").unwrap_or_default(),
        state: field_str(fields, "System.State").unwrap_or_default(),
        item_type: field_str(fields, "System.WorkItemType").unwrap_or_default(),
        assigned_to: identity_name(fields.get("System.AssignedTo")),
        tags: field_str(fields, "System.Tags")
            .map(|t| {
                t.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        priority: fields
            .get("Microsoft.VSTS.Common.Priority")
            .and_then(Value::as_u64)
            .and_then(|p| u8::try_from(p).ok()),
        iteration_path: field_str(fields, "System.IterationPath"),
        parent_id: fields.get("System.Parent").and_then(Value::as_u64),
        changed_date: field_str(fields, "System.ChangedDate")
            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
            .map(|d| d.with_timezone(&Utc)),
        url: raw.url,
        relevance: None,
    }
}

fn flatten_queries(nodes: Vec<RawQueryNode>, out: &mut Vec<SavedQuery>) {
    for node in nodes {
        if !node.is_folder {
            out.push(SavedQuery {
                id: node.id,
                name: node.name,
                path: node.path,
                wiql: node.wiql,
            });
        }
        flatten_queries(node.children, out);
    }
}

#[async_trait]
impl WorkItemBackend for RestTracker {
    fn source(&self) -> BackendSource {
        BackendSource::Rest
    }

    /// REST mode is available whenever it is fully configured.
    async fn probe(&self, _deadline: &Deadline) -> bool {
        self.config.validate().is_ok()
    }

    async fn search(
        &self,
        criteria: &SearchCriteria,
        deadline: &Deadline,
    ) -> Result<Vec<WorkItem>, ProviderError> {
        let wiql = build_query(criteria);
        debug!(wiql = %wiql, "Running REST work item query");
        let mut ids = self.run_wiql(&wiql, deadline).await?;
        ids.truncate(self.max_items);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_items(&ids, deadline).await
    }
}

#[async_trait]
impl MetadataSource for RestTracker {
    async fn sprints(&self, deadline: &Deadline) -> Result<Vec<Sprint>, ProviderError> {
        let spec = RequestSpec::get(
            SERVICE,
            format!("{}/_apis/work/teamsettings/iterations", self.team_url()),
        );
        let list: ValueList<RawIteration> = self.get_json(spec, deadline).await?;
        Ok(list
            .value
            .into_iter()
            .map(|it| {
                let attrs = it.attributes;
                Sprint {
                    id: it.id,
                    name: it.name,
                    path: it.path,
                    start_date: attrs.as_ref().and_then(|a| a.start_date),
                    finish_date: attrs.as_ref().and_then(|a| a.finish_date),
                    time_frame: attrs.as_ref().and_then(|a| a.time_frame),
                }
            })
            .collect())
    }

    async fn users(&self, deadline: &Deadline) -> Result<Vec<TrackerUser>, ProviderError> {
        let spec = RequestSpec::get(
            SERVICE,
            format!(
                "{}/_apis/projects/{}/teams/{}/members",
                self.org_url(),
                self.config.project,
                self.team_name()
            ),
        );
        let list: ValueList<RawMember> = self.get_json(spec, deadline).await?;
        Ok(list
            .value
            .into_iter()
            .map(|m| TrackerUser {
                id: m.identity.id,
                display_name: m.identity.display_name,
                email: m.identity.unique_name,
            })
            .collect())
    }

    /// States are read from the work item type definitions and
    /// de-duplicated by name, keeping first-seen order.
    async fn states(&self, deadline: &Deadline) -> Result<Vec<WorkItemState>, ProviderError> {
        let types = self.raw_types(deadline).await?;
        let mut seen = BTreeSet::new();
        let mut states = Vec::new();
        for state in types.into_iter().flat_map(|t| t.states) {
            if seen.insert(state.name.clone()) {
                states.push(WorkItemState {
                    name: state.name,
                    category: state.category,
                });
            }
        }
        Ok(states)
    }

    async fn types(&self, deadline: &Deadline) -> Result<Vec<WorkItemType>, ProviderError> {
        Ok(self
            .raw_types(deadline)
            .await?
            .into_iter()
            .map(|t| WorkItemType {
                name: t.name,
                description: t.description,
            })
            .collect())
    }

    async fn tags(&self, deadline: &Deadline) -> Result<Vec<Tag>, ProviderError> {
        let spec = RequestSpec::get(SERVICE, format!("{}/_apis/wit/tags", self.project_url()));
        let list: ValueList<RawNamed> = self.get_json(spec, deadline).await?;
        Ok(list
            .value
            .into_iter()
            .map(|t| Tag {
                id: t.id,
                name: t.name,
            })
            .collect())
    }

    async fn queries(&self, deadline: &Deadline) -> Result<Vec<SavedQuery>, ProviderError> {
        let spec = RequestSpec::get(SERVICE, format!("{}/_apis/wit/queries", self.project_url()))
            .query("$depth", "2")
            .query("$expand", "wiql");
        let list: ValueList<RawQueryNode> = self.get_json(spec, deadline).await?;
        let mut queries = Vec::new();
        flatten_queries(list.value, &mut queries);
        Ok(queries)
    }

    async fn projects(&self, deadline: &Deadline) -> Result<Vec<Project>, ProviderError> {
        let spec = RequestSpec::get(SERVICE, format!("{}/_apis/projects", self.org_url()));
        let list: ValueList<RawNamed> = self.get_json(spec, deadline).await?;
        Ok(list
            .value
            .into_iter()
            .map(|p| Project {
                id: p.id,
                name: p.name,
                description: p.description,
            })
            .collect())
    }

    async fn teams(&self, deadline: &Deadline) -> Result<Vec<Team>, ProviderError> {
        let spec = RequestSpec::get(
            SERVICE,
            format!(
                "{}/_apis/projects/{}/teams",
                self.org_url(),
                self.config.project
            ),
        );
        let list: ValueList<RawNamed> = self.get_json(spec, deadline).await?;
        Ok(list
            .value
            .into_iter()
            .map(|t| Team {
                id: t.id,
                name: t.name,
                description: t.description,
            })
            .collect())
    }
}

impl RestTracker {
    async fn raw_types(&self, deadline: &Deadline) -> Result<Vec<RawWorkItemType>, ProviderError> {
        let spec = RequestSpec::get(
            SERVICE,
            format!("{}/_apis/wit/workitemtypes", self.project_url()),
        );
        let list: ValueList<RawWorkItemType> = self.get_json(spec, deadline).await?;
        Ok(list.value)
    }
}
