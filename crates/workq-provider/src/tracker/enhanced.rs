//! Enhanced access mode.
//!
//! Talks JSON-RPC 2.0 over HTTP to a tool server that exposes a
//! `search_work_items` tool. The server resolves sprint references and
//! time frames itself and returns a relevance score for full-text
//! searches. Any error, including an empty or malformed tool result, is
//! reported so the caller can fall back to REST mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use workq_core::config::TrackerConfig;
use workq_core::types::{BackendSource, SearchCriteria, WorkItem};

use super::wiql::SprintRef;
use super::WorkItemBackend;
use crate::backoff::Deadline;
use crate::client::{RequestSpec, ResilientClient};
use crate::error::ProviderError;

const SERVICE: &str = "enhanced-tracker";
const SEARCH_TOOL: &str = "search_work_items";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_RESULTS: usize = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnhancedItem {
    id: u64,
    title: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "type", default)]
    item_type: String,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    iteration_path: Option<String>,
    #[serde(default)]
    parent_id: Option<u64>,
    #[serde(default)]
    changed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    score: Option<f32>,
}

impl From<EnhancedItem> for WorkItem {
    fn from(item: EnhancedItem) -> Self {
        WorkItem {
            id: item.id,
            title: item.title,
            state: item.state,
            item_type: item.item_type,
            assigned_to: item.assigned_to,
            tags: item.tags,
            priority: item.priority,
            iteration_path: item.iteration_path,
            parent_id: item.parent_id,
            changed_date: item.changed_date,
            url: item.url,
            relevance: item.score,
        }
    }
}

/// JSON-RPC client for the enhanced query service.
pub struct EnhancedTracker {
    client: Arc<ResilientClient>,
    url: String,
    token: String,
    project: String,
    team: String,
    max_retries: u32,
    next_id: AtomicU64,
}

impl EnhancedTracker {
    pub fn new(client: Arc<ResilientClient>, config: &TrackerConfig, max_retries: u32) -> Self {
        Self {
            client,
            url: config.enhanced_url.trim().to_string(),
            token: config.token.clone(),
            project: config.project.clone(),
            team: config.team.clone(),
            max_retries,
            next_id: AtomicU64::new(1),
        }
    }

    fn rpc_spec(&self, method: &str, params: Value) -> RequestSpec {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let spec = RequestSpec::post(SERVICE, self.url.clone(), body).idempotent(true);
        if self.token.is_empty() {
            spec
        } else {
            spec.header("Authorization", format!("Bearer {}", self.token))
        }
    }

    /// Call a tool and return the JSON document in its first text block.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        deadline: &Deadline,
    ) -> Result<Value, ProviderError> {
        if self.url.is_empty() {
            return Err(ProviderError::Configuration(
                "Enhanced mode is not configured (tracker.enhanced_url).".to_string(),
            ));
        }
        let spec = self.rpc_spec(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        );
        let response = self.client.call(&spec, self.max_retries, deadline).await?;
        parse_tool_result(response.body)
    }
}

/// Unwrap a JSON-RPC `tools/call` response.
fn parse_tool_result(body: Value) -> Result<Value, ProviderError> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ProviderError::invalid_response(
            SERVICE,
            format!("rpc error: {message}"),
        ));
    }

    let result = body
        .get("result")
        .ok_or_else(|| ProviderError::invalid_response(SERVICE, "missing result"))?;
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ProviderError::invalid_response(SERVICE, "tool reported an error"));
    }

    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|b| b.get("text"))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ProviderError::invalid_response(SERVICE, "empty tool result"))?;

    serde_json::from_str(text)
        .map_err(|e| ProviderError::invalid_response(SERVICE, format!("tool result is not JSON: {e}")))
}

/// Tool arguments for a search. Relative sprint references become a time
/// frame plus an offset; anything else is passed as an iteration name.
pub fn search_arguments(criteria: &SearchCriteria, project: &str, team: &str) -> Value {
    let mut args = json!({
        "project": project,
        "top": MAX_RESULTS,
    });
    if !team.is_empty() {
        args["team"] = json!(team);
    }
    if let Some(text) = &criteria.free_text {
        args["query"] = json!(text);
    }
    if let Some(state) = &criteria.status {
        args["state"] = json!(state);
    }
    if let Some(kind) = &criteria.item_type {
        args["type"] = json!(kind);
    }
    if let Some(assignee) = &criteria.assignee {
        args["assignedTo"] = json!(assignee);
    }
    if !criteria.tags.is_empty() {
        args["tags"] = json!(criteria.tags);
    }
    if let Some(priority) = criteria.priority {
        args["priority"] = json!(priority);
    }
    if let Some(sprint) = criteria.timeframe.as_deref().and_then(SprintRef::parse) {
        if let Some(frame) = sprint.time_frame() {
            args["timeframe"] = json!(frame);
        }
        match sprint {
            SprintRef::Named(name) => args["iteration"] = json!(name),
            SprintRef::Offset(offset) => args["iterationOffset"] = json!(offset),
            SprintRef::Current => {}
        }
    }
    args
}

fn parse_items(document: Value) -> Result<Vec<WorkItem>, ProviderError> {
    let list = match document {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => map
            .remove("items")
            .ok_or_else(|| ProviderError::invalid_response(SERVICE, "result has no items"))?,
        _ => return Err(ProviderError::invalid_response(SERVICE, "unexpected result shape")),
    };
    let items: Vec<EnhancedItem> = serde_json::from_value(list)
        .map_err(|e| ProviderError::invalid_response(SERVICE, e.to_string()))?;
    Ok(items.into_iter().map(WorkItem::from).collect())
}

#[async_trait]
impl WorkItemBackend for EnhancedTracker {
    fn source(&self) -> BackendSource {
        BackendSource::Enhanced
    }

    /// A single `ping` with no retries and a short timeout.
    async fn probe(&self, deadline: &Deadline) -> bool {
        if self.url.is_empty() {
            return false;
        }
        let probe_deadline = Deadline::after(deadline.clamp(PROBE_TIMEOUT));
        let spec = self.rpc_spec("ping", json!({}));
        match self.client.call(&spec, 0, &probe_deadline).await {
            Ok(response) => response.body.get("result").is_some(),
            Err(e) => {
                debug!(error = %e, "Enhanced mode probe failed");
                false
            }
        }
    }

    async fn search(
        &self,
        criteria: &SearchCriteria,
        deadline: &Deadline,
    ) -> Result<Vec<WorkItem>, ProviderError> {
        let args = search_arguments(criteria, &self.project, &self.team);
        let document = self.call_tool(SEARCH_TOOL, args, deadline).await?;
        let mut items = parse_items(document)?;

        if criteria.free_text.is_some() {
            items.sort_by(|a, b| {
                b.relevance
                    .unwrap_or(0.0)
                    .total_cmp(&a.relevance.unwrap_or(0.0))
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tracker(url: &str) -> EnhancedTracker {
        let client = Arc::new(
            ResilientClient::new(
                BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    jitter: Duration::ZERO,
                },
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let config = TrackerConfig {
            enhanced_url: url.to_string(),
            project: "Platform".into(),
            team: "Core".into(),
            token: "pat".into(),
            ..TrackerConfig::default()
        };
        EnhancedTracker::new(client, &config, 0)
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    fn tool_response(document: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": document.to_string()}]}
        })
    }

    #[test]
    fn test_search_arguments_resolve_sprints() {
        let criteria = SearchCriteria {
            free_text: Some("login".into()),
            timeframe: Some("last sprint".into()),
            ..Default::default()
        };
        let args = search_arguments(&criteria, "Platform", "Core");
        assert_eq!(args["query"], "login");
        assert_eq!(args["timeframe"], "past");
        assert_eq!(args["iterationOffset"], -1);

        let named = SearchCriteria {
            timeframe: Some("Sprint 42".into()),
            ..Default::default()
        };
        assert_eq!(search_arguments(&named, "Platform", "")["iteration"], "Sprint 42");
    }

    #[test]
    fn test_parse_tool_result_rejects_errors_and_empty() {
        assert!(parse_tool_result(json!({"error": {"code": -32000, "message": "boom"}})).is_err());
        assert!(parse_tool_result(json!({"result": {"isError": true, "content": []}})).is_err());
        assert!(parse_tool_result(json!({"result": {"content": []}})).is_err());
        assert!(parse_tool_result(json!({"result": {"content": [{"type": "text", "text": "not json"}]}})).is_err());
    }

    #[tokio::test]
    async fn search_ranks_by_relevance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": SEARCH_TOOL}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_response(json!({
                "items": [
                    {"id": 1, "title": "Low", "state": "New", "type": "Bug", "score": 0.2},
                    {"id": 2, "title": "High", "state": "New", "type": "Bug", "score": 0.9}
                ]
            }))))
            .mount(&server)
            .await;

        let criteria = SearchCriteria {
            free_text: Some("login".into()),
            ..Default::default()
        };
        let items = tracker(&server.uri()).search(&criteria, &deadline()).await.unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(items[0].relevance, Some(0.9));
    }

    #[tokio::test]
    async fn malformed_result_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tool_response(json!({"rows": 3}))))
            .mount(&server)
            .await;

        let err = tracker(&server.uri())
            .search(&SearchCriteria::default(), &deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn probe_pings_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ping"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        assert!(tracker(&server.uri()).probe(&deadline()).await);
    }

    #[tokio::test]
    async fn probe_fails_when_unconfigured_or_down() {
        assert!(!tracker("").probe(&deadline()).await);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(!tracker(&server.uri()).probe(&deadline()).await);
    }
}
