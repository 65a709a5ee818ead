//! Route handler functions for all API endpoints.
//!
//! Each handler extracts path/body parameters via axum extractors, checks
//! the caller's identity against the resource, and returns JSON.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use workq_chat::{ChatError, QueryRequest};
use workq_core::types::{
    ContextStats, Conversation, ConversationPatch, EntityKind, GlobalFilters, Message,
    MetadataStats, OrchestratorResult, QueryOptions,
};
use workq_provider::ProviderError;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::rate_limit::{self, OP_METADATA_REFRESH};
use crate::state::AppState;

const GENERIC_FAILURE: &str =
    "Something went wrong while answering your question. Please try again.";

// =============================================================================
// Request types
// =============================================================================

/// Body of `POST /chat`. Required fields are optional here so that a
/// missing one yields a 400 with a readable message.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub query: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub filters: GlobalFilters,
    #[serde(default)]
    pub options: QueryOptions,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteBody {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataAction {
    Preload,
    Refresh,
}

#[derive(Debug, Deserialize)]
pub struct MetadataActionBody {
    pub action: MetadataAction,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub rest: bool,
    pub enhanced: bool,
    pub llm_providers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub backends: BackendStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationList {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkDeleteResult {
    pub deleted: usize,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResult {
    pub deleted: Vec<Uuid>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataActionResult {
    pub cached: bool,
    pub last_updated: DateTime<Utc>,
    pub counts: std::collections::BTreeMap<String, usize>,
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid id", raw)))
}

/// Load a conversation and verify the caller owns it.
fn owned_conversation(
    state: &AppState,
    id: Uuid,
    user: &AuthenticatedUser,
) -> Result<Conversation, ApiError> {
    let conversation = state
        .conversations()
        .get_conversation(id)?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {} was not found", id)))?;
    if !conversation.is_owned_by(&user.email) {
        tracing::warn!(conversation_id = %id, "Rejected access to another user's conversation");
        return Err(ApiError::Forbidden(
            "You don't have access to this conversation.".to_string(),
        ));
    }
    Ok(conversation)
}

// =============================================================================
// Handler functions
// =============================================================================

/// GET /health - liveness plus which backends are configured.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = &state.config;
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        backends: BackendStatus {
            rest: config.tracker.validate().is_ok(),
            enhanced: config.tracker.enhanced_configured(),
            llm_providers: config.providers.len(),
        },
    })
}

/// POST /chat - run one question through the pipeline.
///
/// Missing fields and identity mismatches are rejected before any network
/// call. Unexpected failures still return a well-formed fallback payload.
pub async fn chat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ChatBody>,
) -> Response {
    let query = body.query.unwrap_or_default();
    if query.trim().is_empty() {
        return ApiError::BadRequest("Field 'query' is required".to_string()).into_response();
    }
    let user_id = body.user_id.unwrap_or_default();
    if user_id.trim().is_empty() {
        return ApiError::BadRequest("Field 'userId' is required".to_string()).into_response();
    }
    if user_id != user.email {
        return ApiError::Forbidden("userId does not match the signed-in user".to_string())
            .into_response();
    }

    let request = QueryRequest {
        query,
        conversation_id: body.conversation_id,
        user_id,
        filters: body.filters,
        options: body.options,
    };

    match state.orchestrator.process(request).await {
        Ok(result) => Json(result).into_response(),
        Err(
            e @ (ChatError::EmptyQuery
            | ChatError::MissingUser
            | ChatError::ConversationNotFound(_)
            | ChatError::Forbidden(_)),
        ) => ApiError::from(e).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Chat request failed");
            let summary = match &e {
                ChatError::Provider(ProviderError::Configuration(msg)) => msg.clone(),
                _ => GENERIC_FAILURE.to_string(),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OrchestratorResult::fallback(summary, body.conversation_id)),
            )
                .into_response()
        }
    }
}

/// GET /conversations - the caller's conversations, most recent first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<ConversationList>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let conversations = state
        .conversations()
        .list_user_conversations(&user.email, limit)?;
    Ok(Json(ConversationList { conversations }))
}

/// POST /conversations - start an empty conversation.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Option<Json<CreateConversationBody>>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let conversation = state.conversations().create_conversation(
        &user.email,
        body.title.as_deref(),
        body.model.as_deref(),
        body.system_prompt.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /conversations/{id} - record plus the recent message window.
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let id = parse_id(&id)?;
    let conversation = owned_conversation(&state, id, &user)?;
    let store = state.conversations();
    let limit = params.limit.unwrap_or_else(|| store.context_window());
    let messages = store.get_messages(id, limit)?;
    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

/// PATCH /conversations/{id} - rename or retag a conversation.
pub async fn update_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(patch): Json<ConversationPatch>,
) -> Result<Json<Conversation>, ApiError> {
    let id = parse_id(&id)?;
    owned_conversation(&state, id, &user)?;
    let updated = state.conversations().update_conversation(id, &patch)?;
    Ok(Json(updated))
}

/// DELETE /conversations/{id}
pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResult>, ApiError> {
    let id = parse_id(&id)?;
    owned_conversation(&state, id, &user)?;
    let deleted = state.conversations().delete_conversation(id)?;
    Ok(Json(DeleteResult { deleted }))
}

/// GET /conversations/{id}/context
pub async fn context_stats(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<ContextStats>, ApiError> {
    let id = parse_id(&id)?;
    state
        .orchestrator
        .get_context_stats(id, &user.email)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("conversation {} was not found", id)))
}

/// DELETE /conversations/{id}/context
pub async fn clear_context(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResult>, ApiError> {
    let id = parse_id(&id)?;
    let deleted = state.orchestrator.clear_context(id, &user.email)?;
    Ok(Json(DeleteResult { deleted }))
}

/// POST /conversations/bulk-delete
///
/// Each id is handled on its own: a failure is reported in `failures` and
/// the remaining ids are still processed.
pub async fn bulk_delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<BulkDeleteBody>,
) -> Json<BulkDeleteResult> {
    let mut deleted = 0;
    let mut failures = Vec::new();

    for raw in body.ids {
        let outcome = parse_id(&raw)
            .and_then(|id| owned_conversation(&state, id, &user).map(|_| id))
            .and_then(|id| Ok(state.conversations().delete_conversation(id)?));
        match outcome {
            Ok(true) => deleted += 1,
            Ok(false) => failures.push(BulkFailure {
                id: raw,
                error: "conversation was not found".to_string(),
            }),
            Err(e) => failures.push(BulkFailure {
                id: raw,
                error: bulk_error_message(&e),
            }),
        }
    }

    if !failures.is_empty() {
        tracing::warn!(deleted, failed = failures.len(), "Bulk delete finished with failures");
    }
    Json(BulkDeleteResult { deleted, failures })
}

fn bulk_error_message(err: &ApiError) -> String {
    match err {
        ApiError::Internal(_) => "could not be deleted".to_string(),
        ApiError::BadRequest(msg)
        | ApiError::NotFound(msg)
        | ApiError::Forbidden(msg)
        | ApiError::Unauthorized(msg)
        | ApiError::TooManyRequests(msg)
        | ApiError::Configuration(msg)
        | ApiError::ServiceUnavailable(msg) => msg.clone(),
    }
}

/// POST /conversations/cleanup - retention sweep for the caller.
pub async fn cleanup(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<SweepResult>, ApiError> {
    let deleted = state.conversations().sweep_inactive(&user.email)?;
    Ok(Json(SweepResult {
        count: deleted.len(),
        deleted,
    }))
}

/// GET /metadata - cache status and per-category counts.
pub async fn metadata_stats(State(state): State<AppState>) -> Json<MetadataStats> {
    Json(state.metadata().stats())
}

/// POST /metadata - preload (cache-aware) or refresh (forced) the snapshot.
pub async fn metadata_action(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<MetadataActionBody>,
) -> Result<Json<MetadataActionResult>, ApiError> {
    let deadline = state.deadline();
    let (snapshot, cached) = match body.action {
        MetadataAction::Preload => state.metadata().preload(&deadline).await?,
        MetadataAction::Refresh => {
            rate_limit::check(&state, OP_METADATA_REFRESH, &user.email)?;
            (state.metadata().refresh(&deadline).await?, false)
        }
    };
    tracing::info!(action = ?body.action, cached, "Metadata request served");
    Ok(Json(MetadataActionResult {
        cached,
        last_updated: snapshot.last_updated,
        counts: snapshot.counts(),
    }))
}

/// GET /collections/{kind} - one reference-data category.
///
/// Upstream or configuration failures yield an empty list so a caller's
/// picker keeps working.
pub async fn collection(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind: EntityKind = kind.parse().map_err(ApiError::NotFound)?;
    let entries = match state.metadata().preload_all(&state.deadline()).await {
        Ok(snapshot) => snapshot.collection_json(kind),
        Err(e) => {
            tracing::warn!(kind = %kind, error = %e, "Collection unavailable, returning empty list");
            serde_json::Value::Array(vec![])
        }
    };
    Ok(Json(serde_json::json!({ kind.as_str(): entries })))
}
