//! Integration tests for the workq API.
//!
//! Drives the full router with scripted language-model replies and fake
//! tracker backends over an in-memory database. Each test builds its own
//! state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use workq_api::handlers::{BulkDeleteResult, ConversationDetail, ConversationList};
use workq_api::{create_router, AppState};
use workq_chat::{BackendSelector, MetadataCache, QueryOrchestrator, ResultCache};
use workq_core::config::WorkqConfig;
use workq_core::types::*;
use workq_provider::{
    Completion, CompletionRequest, Deadline, LlmProvider, MetadataSource, ProviderError,
    WorkItemBackend,
};
use workq_storage::{ConversationStore, Database, RateLimitStore};

// =============================================================================
// Fakes
// =============================================================================

const ADA_TOKEN: &str = "test-token-12345";
const ADA: &str = "ada@example.com";
const BOB_TOKEN: &str = "test-token-67890";
const BOB: &str = "bob@example.com";

const INTENT_REPLY: &str = r#"{"needsBackendData": true, "intent": "search_work_items",
    "requiresSummary": true, "searchCriteria": {"type": "Bug", "status": "Active"}}"#;
const SYNTHESIS_REPLY: &str =
    r#"{"summary": "One active bug.", "insights": ["It is unassigned."], "suggestions": []}"#;

struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedLlm {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
        _deadline: &Deadline,
    ) -> Result<Completion, ProviderError> {
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Configuration("no scripted reply".into()))?;
        Ok(Completion {
            text,
            provider: "scripted".into(),
            model: "scripted-1".into(),
            tokens: 10,
        })
    }
}

struct FakeTracker;

#[async_trait]
impl WorkItemBackend for FakeTracker {
    fn source(&self) -> BackendSource {
        BackendSource::Rest
    }

    async fn probe(&self, _deadline: &Deadline) -> bool {
        true
    }

    async fn search(
        &self,
        _criteria: &SearchCriteria,
        _deadline: &Deadline,
    ) -> Result<Vec<WorkItem>, ProviderError> {
        Ok(vec![WorkItem {
            id: 7,
            title: "Checkout times out".into(),
            state: "Active".into(),
            item_type: "Bug".into(),
            assigned_to: None,
            tags: vec![],
            priority: Some(1),
            iteration_path: None,
            parent_id: None,
            changed_date: None,
            url: None,
            relevance: None,
        }])
    }
}

#[async_trait]
impl MetadataSource for FakeTracker {
    async fn sprints(&self, _deadline: &Deadline) -> Result<Vec<Sprint>, ProviderError> {
        Ok(vec![])
    }
    async fn users(&self, _deadline: &Deadline) -> Result<Vec<TrackerUser>, ProviderError> {
        Ok(vec![])
    }
    async fn states(&self, _deadline: &Deadline) -> Result<Vec<WorkItemState>, ProviderError> {
        Ok(vec![
            WorkItemState {
                name: "Active".into(),
                category: Some("InProgress".into()),
            },
            WorkItemState {
                name: "Closed".into(),
                category: Some("Completed".into()),
            },
        ])
    }
    async fn types(&self, _deadline: &Deadline) -> Result<Vec<WorkItemType>, ProviderError> {
        Ok(vec![WorkItemType {
            name: "Bug".into(),
            description: None,
        }])
    }
    async fn tags(&self, _deadline: &Deadline) -> Result<Vec<Tag>, ProviderError> {
        Ok(vec![])
    }
    async fn queries(&self, _deadline: &Deadline) -> Result<Vec<SavedQuery>, ProviderError> {
        Ok(vec![])
    }
    async fn projects(&self, _deadline: &Deadline) -> Result<Vec<Project>, ProviderError> {
        Ok(vec![
            Project {
                id: "p1".into(),
                name: "Platform".into(),
                description: None,
            },
            Project {
                id: "p2".into(),
                name: "Mobile".into(),
                description: None,
            },
        ])
    }
    async fn teams(&self, _deadline: &Deadline) -> Result<Vec<Team>, ProviderError> {
        Ok(vec![])
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn make_state_with(config: WorkqConfig, replies: &[&str]) -> AppState {
    let mut config = config;
    config.auth.sessions.insert(ADA_TOKEN.into(), ADA.into());
    config.auth.sessions.insert(BOB_TOKEN.into(), BOB.into());

    let db = Arc::new(Database::in_memory().unwrap());
    let store = Arc::new(ConversationStore::new(
        Arc::clone(&db),
        config.conversation.clone(),
    ));
    let tracker = Arc::new(FakeTracker);
    let selector = Arc::new(BackendSelector::new(
        None,
        tracker.clone(),
        Arc::new(ResultCache::new(Duration::from_secs(60))),
    ));
    let metadata = Arc::new(MetadataCache::new(tracker, Duration::from_secs(3600)));
    let orchestrator = Arc::new(QueryOrchestrator::new(
        store,
        Arc::new(ScriptedLlm::new(replies)),
        selector,
        metadata,
        config.orchestrator.clone(),
        false,
    ));
    AppState::new(config, orchestrator, Arc::new(RateLimitStore::new(db)))
}

fn make_state(replies: &[&str]) -> AppState {
    make_state_with(WorkqConfig::default(), replies)
}

fn request(token: &str, method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
    let resp = create_router(state.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

async fn create_conversation(state: &AppState, token: &str, title: &str) -> Uuid {
    let (status, body) = send(
        state,
        request(token, "POST", "/conversations", Some(json!({ "title": title }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    serde_json::from_value::<Conversation>(body).unwrap().id
}

// =============================================================================
// Chat
// =============================================================================

#[tokio::test]
async fn test_chat_full_round_trip() {
    let state = make_state(&[INTENT_REPLY, SYNTHESIS_REPLY]);
    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "which bugs are active?", "userId": ADA })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let result: OrchestratorResult = serde_json::from_value(body).unwrap();
    assert!(result.success);
    assert_eq!(result.summary, "One active bug.");
    assert_eq!(result.raw_data.len(), 1);
    assert!(result.metadata.data_sources.contains(&"rest".to_string()));
    // Not verbose: no per-stage reports.
    assert!(result.metadata.stages.is_none());

    let id = result.conversation_id.unwrap();
    let (status, body) = send(
        &state,
        request(ADA_TOKEN, "GET", &format!("/conversations/{}", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let detail: ConversationDetail = serde_json::from_value(body).unwrap();
    assert_eq!(detail.messages.len(), 2);
    assert_eq!(detail.messages[0].role, Role::User);
    assert_eq!(detail.messages[1].content, "One active bug.");
    assert!(detail.conversation.title.starts_with("which bugs are active?"));

    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "GET",
            &format!("/conversations/{}/context", id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let stats: ContextStats = serde_json::from_value(body).unwrap();
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.total_tokens, 20);
}

#[tokio::test]
async fn test_chat_collection_question_answers_from_reference_data() {
    let state = make_state(&[]);
    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "list all projects", "userId": ADA, "options": { "verbose": true } })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let result: OrchestratorResult = serde_json::from_value(body).unwrap();
    assert!(result.success);
    assert!(result.summary.contains("Platform"));
    assert!(result.summary.contains("Mobile"));
    assert!(result.metadata.stages.is_some());
}

#[tokio::test]
async fn test_chat_unknown_conversation_is_404() {
    let state = make_state(&[]);
    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "list all projects", "userId": ADA, "conversationId": Uuid::new_v4() })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_chat_into_another_users_conversation_is_403() {
    let state = make_state(&[]);
    let bobs = create_conversation(&state, BOB_TOKEN, "Bob's planning").await;

    let (status, _) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "list all projects", "userId": ADA, "conversationId": bobs })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Nothing was appended to Bob's conversation.
    let (_, body) = send(
        &state,
        request(BOB_TOKEN, "GET", &format!("/conversations/{}", bobs), None),
    )
    .await;
    let detail: ConversationDetail = serde_json::from_value(body).unwrap();
    assert!(detail.messages.is_empty());
}

#[tokio::test]
async fn test_chat_rate_limited_after_ceiling() {
    let mut config = WorkqConfig::default();
    config.rate_limit.chat_per_window = 2;
    config.rate_limit.window_secs = 600;
    let state = make_state_with(config, &[]);

    for _ in 0..2 {
        let (status, _) = send(
            &state,
            request(
                ADA_TOKEN,
                "POST",
                "/chat",
                Some(json!({ "query": "list all projects", "userId": ADA })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "list all projects", "userId": ADA })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Try again in 10 minutes"));

    // Counters are per identity.
    let (status, _) = send(
        &state,
        request(
            BOB_TOKEN,
            "POST",
            "/chat",
            Some(json!({ "query": "list all projects", "userId": BOB })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Conversations
// =============================================================================

#[tokio::test]
async fn test_list_only_own_conversations() {
    let state = make_state(&[]);
    create_conversation(&state, ADA_TOKEN, "First").await;
    create_conversation(&state, ADA_TOKEN, "Second").await;
    create_conversation(&state, BOB_TOKEN, "Bob's").await;

    let (status, body) = send(&state, request(ADA_TOKEN, "GET", "/conversations", None)).await;
    assert_eq!(status, StatusCode::OK);
    let list: ConversationList = serde_json::from_value(body).unwrap();
    assert_eq!(list.conversations.len(), 2);
    assert!(list.conversations.iter().all(|c| c.user_id == ADA));
}

#[tokio::test]
async fn test_rename_conversation() {
    let state = make_state(&[]);
    let id = create_conversation(&state, ADA_TOKEN, "Draft").await;

    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "PATCH",
            &format!("/conversations/{}", id),
            Some(json!({ "title": "Release readiness" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Release readiness");
}

#[tokio::test]
async fn test_other_users_conversation_is_untouchable() {
    let state = make_state(&[]);
    let id = create_conversation(&state, BOB_TOKEN, "Bob's").await;
    let uri = format!("/conversations/{}", id);

    let (status, _) = send(&state, request(ADA_TOKEN, "GET", &uri, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &state,
        request(ADA_TOKEN, "PATCH", &uri, Some(json!({ "title": "mine now" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&state, request(ADA_TOKEN, "DELETE", &uri, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &state,
        request(ADA_TOKEN, "DELETE", &format!("{}/context", uri), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Still intact for its owner.
    let (status, body) = send(&state, request(BOB_TOKEN, "GET", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversation"]["title"], "Bob's");
}

#[tokio::test]
async fn test_delete_conversation() {
    let state = make_state(&[]);
    let id = create_conversation(&state, ADA_TOKEN, "Scratch").await;
    let uri = format!("/conversations/{}", id);

    let (status, body) = send(&state, request(ADA_TOKEN, "DELETE", &uri, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, _) = send(&state, request(ADA_TOKEN, "GET", &uri, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_bulk_delete_isolates_failures() {
    let state = make_state(&[]);
    let a = create_conversation(&state, ADA_TOKEN, "A").await;
    let b = create_conversation(&state, ADA_TOKEN, "B").await;
    let bobs = create_conversation(&state, BOB_TOKEN, "Bob's").await;

    let (status, body) = send(
        &state,
        request(
            ADA_TOKEN,
            "POST",
            "/conversations/bulk-delete",
            Some(json!({ "ids": [a, "not-a-uuid", bobs, b] })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result: BulkDeleteResult = serde_json::from_value(body).unwrap();
    assert_eq!(result.deleted, 2);
    assert_eq!(result.failures.len(), 2);
    assert_eq!(result.failures[0].id, "not-a-uuid");
    assert_eq!(result.failures[1].id, bobs.to_string());

    let (status, _) = send(
        &state,
        request(BOB_TOKEN, "GET", &format!("/conversations/{}", bobs), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_cleanup_keeps_recent_conversations() {
    let state = make_state(&[]);
    create_conversation(&state, ADA_TOKEN, "Fresh").await;

    let (status, body) = send(
        &state,
        request(ADA_TOKEN, "POST", "/conversations/cleanup", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["deleted"], json!([]));
}

// =============================================================================
// Reference data
// =============================================================================

#[tokio::test]
async fn test_metadata_preload_then_cached() {
    let state = make_state(&[]);
    let preload = json!({ "action": "preload" });

    let (status, body) = send(
        &state,
        request(ADA_TOKEN, "POST", "/metadata", Some(preload.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached"], false);
    assert_eq!(body["counts"]["projects"], 2);
    assert_eq!(body["counts"]["states"], 2);

    let (_, body) = send(&state, request(ADA_TOKEN, "POST", "/metadata", Some(preload))).await;
    assert_eq!(body["cached"], true);

    let (status, body) = send(&state, request(ADA_TOKEN, "GET", "/metadata", None)).await;
    assert_eq!(status, StatusCode::OK);
    let stats: MetadataStats = serde_json::from_value(body).unwrap();
    assert!(stats.cached);
    assert_eq!(stats.counts.get("types"), Some(&1));
}

#[tokio::test]
async fn test_metadata_refresh_is_rate_limited() {
    let mut config = WorkqConfig::default();
    config.rate_limit.metadata_refresh_per_window = 1;
    let state = make_state_with(config, &[]);
    let refresh = json!({ "action": "refresh" });

    let (status, body) = send(
        &state,
        request(ADA_TOKEN, "POST", "/metadata", Some(refresh.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached"], false);

    let (status, _) = send(&state, request(ADA_TOKEN, "POST", "/metadata", Some(refresh))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_collection_endpoint() {
    let state = make_state(&[]);
    let (status, body) = send(
        &state,
        request(ADA_TOKEN, "GET", "/collections/projects", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let projects = body["projects"].as_array().unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0]["name"], "Platform");
}
