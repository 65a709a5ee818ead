//! Conversation context store.
//!
//! Persists an append-only, timestamp-ordered message log per conversation
//! and keeps the derived conversation record (count, preview, title,
//! token total) in step with every append.
//!
//! The store does not check ownership. Every caller must compare
//! `Conversation::user_id` with the authenticated user before reading,
//! mutating or deleting.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use workq_core::config::ConversationConfig;
use workq_core::error::WorkqError;
use workq_core::types::{Conversation, ConversationPatch, Message, Role};

use crate::db::{storage_err, Database};

/// Title given to a conversation before its first user message.
pub const DEFAULT_TITLE: &str = "New conversation";

const CONVERSATION_COLUMNS: &str = "id, user_id, title, created_at, updated_at, message_count,
     model, total_tokens, last_message_preview, metadata";

/// SQLite-backed conversation store.
pub struct ConversationStore {
    db: Arc<Database>,
    config: ConversationConfig,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>, config: ConversationConfig) -> Self {
        Self { db, config }
    }

    /// Number of recent messages callers should load as prompt context.
    pub fn context_window(&self) -> usize {
        self.config.context_messages
    }

    /// Create a conversation owned by `user_id`.
    ///
    /// A system prompt, when given, becomes the first message of the log.
    pub fn create_conversation(
        &self,
        user_id: &str,
        title: Option<&str>,
        model: Option<&str>,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, WorkqError> {
        let id = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, user_id, title, created_at, updated_at, model)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                params![id.to_string(), user_id, title, now, model],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to create conversation: {}", e)))?;
            Ok(())
        })?;
        debug!(conversation_id = %id, user_id, "Conversation created");

        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            self.add_message(id, Role::System, prompt, None)?;
        }

        self.get_conversation(id)?
            .ok_or_else(|| WorkqError::NotFound(format!("conversation {}", id)))
    }

    /// Append one message and update the conversation record.
    ///
    /// The message row (including any metadata) is written exactly once,
    /// in the same transaction as the count, preview, title and token
    /// updates.
    pub fn add_message(
        &self,
        conversation_id: Uuid,
        role: Role,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message, WorkqError> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4(),
            role,
            content: content.to_string(),
            timestamp: now,
            metadata,
        };
        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tokens = message
            .metadata
            .as_ref()
            .and_then(|m| m.get("tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);

        self.db.with_tx(|tx| {
            let current = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations WHERE id = ?1",
                        CONVERSATION_COLUMNS
                    ),
                    params![conversation_id.to_string()],
                    row_to_conversation,
                )
                .optional()
                .map_err(storage_err)?
                .ok_or_else(|| WorkqError::NotFound(format!("conversation {}", conversation_id)))??;

            tx.execute(
                "INSERT INTO conversation_messages (id, conversation_id, role, content, timestamp_ms, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id.to_string(),
                    conversation_id.to_string(),
                    role.as_str(),
                    content,
                    now.timestamp_millis(),
                    metadata_json,
                ],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to append message: {}", e)))?;

            let title = if role == Role::User {
                let prior_user_messages: i64 = tx
                    .query_row(
                        "SELECT COUNT(*) FROM conversation_messages
                         WHERE conversation_id = ?1 AND role = 'user' AND id != ?2",
                        params![conversation_id.to_string(), message.id.to_string()],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?;
                derive_title(
                    &current.title,
                    content,
                    prior_user_messages == 0,
                    now.with_timezone(&Local),
                    self.config.title_chars,
                )
            } else {
                current.title.clone()
            };

            let updated_at = current.updated_at.timestamp_millis().max(now.timestamp_millis());
            let preview = truncate_chars(content, self.config.preview_chars);

            tx.execute(
                "UPDATE conversations
                 SET message_count = message_count + 1,
                     last_message_preview = ?2,
                     updated_at = ?3,
                     total_tokens = total_tokens + ?4,
                     title = ?5
                 WHERE id = ?1",
                params![
                    conversation_id.to_string(),
                    preview,
                    updated_at,
                    tokens as i64,
                    title,
                ],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to update conversation: {}", e)))?;
            Ok(())
        })?;

        Ok(message)
    }

    /// Fetch a conversation record.
    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, WorkqError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations WHERE id = ?1",
                        CONVERSATION_COLUMNS
                    ),
                    params![id.to_string()],
                    row_to_conversation,
                )
                .optional()
                .map_err(storage_err)?;
            result.transpose()
        })
    }

    /// The most recent `limit` messages, oldest first.
    pub fn get_messages(&self, id: Uuid, limit: usize) -> Result<Vec<Message>, WorkqError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, role, content, timestamp_ms, metadata
                     FROM conversation_messages
                     WHERE conversation_id = ?1
                     ORDER BY timestamp_ms DESC, seq DESC
                     LIMIT ?2",
                )
                .map_err(storage_err)?;

            let rows = stmt
                .query_map(params![id.to_string(), limit as i64], |row| {
                    Ok(row_to_message(row))
                })
                .map_err(storage_err)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.map_err(storage_err)??);
            }
            messages.reverse();
            Ok(messages)
        })
    }

    /// Apply a partial update and return the new record.
    pub fn update_conversation(
        &self,
        id: Uuid,
        patch: &ConversationPatch,
    ) -> Result<Conversation, WorkqError> {
        let metadata_json = patch.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations
                 SET title = COALESCE(?2, title),
                     model = COALESCE(?3, model),
                     metadata = COALESCE(?4, metadata),
                     updated_at = MAX(updated_at, ?5)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    patch.title.as_deref().map(str::trim).filter(|t| !t.is_empty()),
                    patch.model,
                    metadata_json,
                    Utc::now().timestamp_millis(),
                ],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to update conversation: {}", e)))
        })?;

        if changed == 0 {
            return Err(WorkqError::NotFound(format!("conversation {}", id)));
        }
        self.get_conversation(id)?
            .ok_or_else(|| WorkqError::NotFound(format!("conversation {}", id)))
    }

    /// A user's conversations, most recently active first.
    pub fn list_user_conversations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>, WorkqError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM conversations
                     WHERE user_id = ?1
                     ORDER BY updated_at DESC
                     LIMIT ?2",
                    CONVERSATION_COLUMNS
                ))
                .map_err(storage_err)?;

            let rows = stmt
                .query_map(params![user_id, limit as i64], row_to_conversation)
                .map_err(storage_err)?;

            let mut conversations = Vec::new();
            for row in rows {
                conversations.push(row.map_err(storage_err)??);
            }
            Ok(conversations)
        })
    }

    /// Delete a conversation and its messages. Returns false if it did not exist.
    pub fn delete_conversation(&self, id: Uuid) -> Result<bool, WorkqError> {
        let deleted = self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM conversation_messages WHERE conversation_id = ?1",
                params![id.to_string()],
            )
            .map_err(storage_err)?;
            tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to delete conversation: {}", e)))
        })?;
        Ok(deleted > 0)
    }

    /// Delete the user's conversations idle past the retention window.
    pub fn sweep_inactive(&self, user_id: &str) -> Result<Vec<Uuid>, WorkqError> {
        self.sweep_inactive_at(user_id, Utc::now())
    }

    /// Sweep relative to an explicit `now`. Returns exactly the deleted ids.
    pub fn sweep_inactive_at(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, WorkqError> {
        let cutoff = (now - Duration::days(self.config.retention_days)).timestamp_millis();

        let deleted = self.db.with_tx(|tx| {
            let mut stale = Vec::new();
            {
                let mut stmt = tx
                    .prepare(
                        "SELECT id FROM conversations WHERE user_id = ?1 AND updated_at < ?2",
                    )
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map(params![user_id, cutoff], |row| row.get::<_, String>(0))
                    .map_err(storage_err)?;
                for row in rows {
                    let raw = row.map_err(storage_err)?;
                    stale.push(parse_uuid(&raw)?);
                }
            }

            for id in &stale {
                tx.execute(
                    "DELETE FROM conversation_messages WHERE conversation_id = ?1",
                    params![id.to_string()],
                )
                .map_err(storage_err)?;
                tx.execute(
                    "DELETE FROM conversations WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(storage_err)?;
            }
            Ok(stale)
        })?;

        if !deleted.is_empty() {
            info!(user_id, count = deleted.len(), "Swept inactive conversations");
        }
        Ok(deleted)
    }
}

/// Compute the conversation title after a user message.
///
/// The first user message yields `"<first N chars> (<Mon D, H:MM AM>)"`.
/// Later user messages re-derive the title from their own text without the
/// timestamp suffix. Blank messages leave the title unchanged.
pub fn derive_title(
    current: &str,
    content: &str,
    is_first_user_message: bool,
    now: DateTime<Local>,
    max_chars: usize,
) -> String {
    let base = truncate_chars(content.trim(), max_chars);
    let base = base.trim_end();
    if base.is_empty() {
        return current.to_string();
    }

    if is_first_user_message {
        format!("{} ({})", base, now.format("%b %-d, %-I:%M %p"))
    } else {
        base.to_string()
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn parse_uuid(raw: &str) -> Result<Uuid, WorkqError> {
    Uuid::parse_str(raw).map_err(|e| WorkqError::Storage(format!("Invalid UUID '{}': {}", raw, e)))
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, WorkqError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| WorkqError::Storage(format!("Invalid timestamp: {}", ms)))
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Result<Conversation, WorkqError>> {
    let raw = RawConversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        message_count: row.get(5)?,
        model: row.get(6)?,
        total_tokens: row.get(7)?,
        last_message_preview: row.get(8)?,
        metadata: row.get(9)?,
    };
    Ok(raw.into_conversation())
}

struct RawConversation {
    id: String,
    user_id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    message_count: i64,
    model: Option<String>,
    total_tokens: i64,
    last_message_preview: Option<String>,
    metadata: String,
}

impl RawConversation {
    fn into_conversation(self) -> Result<Conversation, WorkqError> {
        Ok(Conversation {
            id: parse_uuid(&self.id)?,
            user_id: self.user_id,
            title: self.title,
            created_at: millis_to_datetime(self.created_at)?,
            updated_at: millis_to_datetime(self.updated_at)?,
            message_count: self.message_count.max(0) as u64,
            model: self.model,
            total_tokens: self.total_tokens.max(0) as u64,
            last_message_preview: self.last_message_preview,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

fn row_to_message(row: &Row<'_>) -> Result<Message, WorkqError> {
    let id: String = row.get(0).map_err(storage_err)?;
    let role: String = row.get(1).map_err(storage_err)?;
    let content: String = row.get(2).map_err(storage_err)?;
    let timestamp_ms: i64 = row.get(3).map_err(storage_err)?;
    let metadata: Option<String> = row.get(4).map_err(storage_err)?;

    Ok(Message {
        id: parse_uuid(&id)?,
        role: role.parse().map_err(WorkqError::Storage)?,
        content,
        timestamp: millis_to_datetime(timestamp_ms)?,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn make_store() -> ConversationStore {
        let db = Arc::new(Database::in_memory().unwrap());
        ConversationStore::new(db, ConversationConfig::default())
    }

    fn set_updated_at(store: &ConversationStore, id: Uuid, at: DateTime<Utc>) {
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                    params![id.to_string(), at.timestamp_millis()],
                )
                .map_err(storage_err)?;
                Ok(())
            })
            .unwrap();
    }

    fn fixed_local() -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(15, 9, 0)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    // ---- Creation ----

    #[test]
    fn test_create_conversation_defaults() {
        let store = make_store();
        let conv = store
            .create_conversation("ada@example.com", None, Some("gpt-4o-mini"), None)
            .unwrap();
        assert_eq!(conv.user_id, "ada@example.com");
        assert_eq!(conv.title, DEFAULT_TITLE);
        assert_eq!(conv.message_count, 0);
        assert_eq!(conv.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(conv.metadata, json!({}));
    }

    #[test]
    fn test_create_with_system_prompt_appends_system_message() {
        let store = make_store();
        let conv = store
            .create_conversation("ada@example.com", Some("Triage"), None, Some("Be brief."))
            .unwrap();
        assert_eq!(conv.title, "Triage");
        assert_eq!(conv.message_count, 1);
        let messages = store.get_messages(conv.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
    }

    // ---- Appends ----

    #[test]
    fn test_add_message_with_metadata_writes_once() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        store.add_message(conv.id, Role::User, "hello", None).unwrap();

        let before = store.get_conversation(conv.id).unwrap().unwrap().message_count;
        store
            .add_message(
                conv.id,
                Role::Assistant,
                "hi there",
                Some(json!({"tokens": 42, "sources": ["rest"]})),
            )
            .unwrap();
        let after = store.get_conversation(conv.id).unwrap().unwrap();

        assert_eq!(after.message_count, before + 1);
        let messages = store.get_messages(conv.id, 100).unwrap();
        assert_eq!(messages.len() as u64, after.message_count);
        let with_meta: Vec<_> = messages.iter().filter(|m| m.metadata.is_some()).collect();
        assert_eq!(with_meta.len(), 1);
        assert_eq!(with_meta[0].metadata.as_ref().unwrap()["tokens"], 42);
        assert_eq!(after.total_tokens, 42);
    }

    #[test]
    fn test_add_message_to_missing_conversation_fails() {
        let store = make_store();
        let result = store.add_message(Uuid::new_v4(), Role::User, "hello", None);
        assert!(matches!(result, Err(WorkqError::NotFound(_))));
    }

    #[test]
    fn test_message_count_matches_log() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        for i in 0..7 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store.add_message(conv.id, role, &format!("m{}", i), None).unwrap();
        }
        let conv = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(conv.message_count, 7);
        assert_eq!(store.get_messages(conv.id, 100).unwrap().len(), 7);
    }

    #[test]
    fn test_get_messages_returns_recent_window_in_order() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        for i in 0..6 {
            store.add_message(conv.id, Role::User, &format!("m{}", i), None).unwrap();
        }
        let recent = store.get_messages(conv.id, 3).unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn test_preview_truncated_to_100_chars() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let long = "x".repeat(250);
        store.add_message(conv.id, Role::Assistant, &long, None).unwrap();
        let conv = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(conv.last_message_preview.unwrap().chars().count(), 100);
    }

    #[test]
    fn test_updated_at_never_decreases() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let future = Utc::now() + Duration::hours(1);
        set_updated_at(&store, conv.id, future);
        store.add_message(conv.id, Role::User, "hello", None).unwrap();
        let conv = store.get_conversation(conv.id).unwrap().unwrap();
        assert_eq!(conv.updated_at.timestamp_millis(), future.timestamp_millis());
    }

    // ---- Titles ----

    #[test]
    fn test_derive_title_first_message_has_timestamp() {
        let title = derive_title(DEFAULT_TITLE, "Fix the login bug", true, fixed_local(), 50);
        assert_eq!(title, "Fix the login bug (Mar 14, 3:09 PM)");
    }

    #[test]
    fn test_derive_title_truncates_to_limit() {
        let content = "a".repeat(80);
        let title = derive_title(DEFAULT_TITLE, &content, true, fixed_local(), 50);
        assert!(title.starts_with(&"a".repeat(50)));
        assert!(!title.starts_with(&"a".repeat(51)));
    }

    #[test]
    fn test_derive_title_later_message_has_no_suffix() {
        let first = derive_title(DEFAULT_TITLE, "Fix the login bug", true, fixed_local(), 50);
        let second = derive_title(&first, "And the signup bug", false, fixed_local(), 50);
        assert_eq!(second, "And the signup bug");
        assert_eq!(derive_title(&second, "   ", false, fixed_local(), 50), second);
    }

    #[test]
    fn test_derive_title_placeholder_gets_plain_text() {
        let title = derive_title(DEFAULT_TITLE, "Sprint status", false, fixed_local(), 50);
        assert_eq!(title, "Sprint status");
    }

    #[test]
    fn test_title_set_on_first_user_message() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        store.add_message(conv.id, Role::User, "Fix the login bug", None).unwrap();
        let title = store.get_conversation(conv.id).unwrap().unwrap().title;
        assert!(title.starts_with("Fix the login bug ("), "got {}", title);
        assert!(title.ends_with(')'));

        store.add_message(conv.id, Role::Assistant, "On it", None).unwrap();
        store.add_message(conv.id, Role::User, "Also the signup bug", None).unwrap();
        let second = store.get_conversation(conv.id).unwrap().unwrap().title;
        assert_eq!(second, "Also the signup bug");

        // Assistant replies never touch the title.
        store.add_message(conv.id, Role::Assistant, "Looking", None).unwrap();
        let third = store.get_conversation(conv.id).unwrap().unwrap().title;
        assert_eq!(third, "Also the signup bug");
    }

    // ---- Update / list / delete ----

    #[test]
    fn test_update_conversation_patch() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let patch = ConversationPatch {
            title: Some("Release blockers".into()),
            model: None,
            metadata: Some(json!({"pinned": true})),
        };
        let updated = store.update_conversation(conv.id, &patch).unwrap();
        assert_eq!(updated.title, "Release blockers");
        assert_eq!(updated.metadata["pinned"], true);
        assert!(updated.updated_at >= conv.updated_at);
    }

    #[test]
    fn test_update_missing_conversation_is_not_found() {
        let store = make_store();
        let result = store.update_conversation(Uuid::new_v4(), &ConversationPatch::default());
        assert!(matches!(result, Err(WorkqError::NotFound(_))));
    }

    #[test]
    fn test_list_user_conversations_is_scoped_and_ordered() {
        let store = make_store();
        let a = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let b = store.create_conversation("ada@example.com", None, None, None).unwrap();
        store.create_conversation("bob@example.com", None, None, None).unwrap();
        set_updated_at(&store, a.id, Utc::now() + Duration::minutes(5));

        let list = store.list_user_conversations("ada@example.com", 10).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);

        let limited = store.list_user_conversations("ada@example.com", 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_delete_conversation_removes_messages() {
        let store = make_store();
        let conv = store.create_conversation("ada@example.com", None, None, None).unwrap();
        store.add_message(conv.id, Role::User, "hello", None).unwrap();
        assert!(store.delete_conversation(conv.id).unwrap());
        assert!(store.get_conversation(conv.id).unwrap().is_none());
        assert!(store.get_messages(conv.id, 10).unwrap().is_empty());
        assert!(!store.delete_conversation(conv.id).unwrap());
    }

    // ---- Sweep ----

    #[test]
    fn test_sweep_deletes_only_stale_conversations() {
        let store = make_store();
        let now = Utc::now();
        let stale = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let fresh = store.create_conversation("ada@example.com", None, None, None).unwrap();
        let other_user = store.create_conversation("bob@example.com", None, None, None).unwrap();
        set_updated_at(&store, stale.id, now - Duration::days(6));
        set_updated_at(&store, fresh.id, now - Duration::days(1));
        set_updated_at(&store, other_user.id, now - Duration::days(30));

        let deleted = store.sweep_inactive_at("ada@example.com", now).unwrap();
        assert_eq!(deleted, vec![stale.id]);
        assert!(store.get_conversation(stale.id).unwrap().is_none());
        assert!(store.get_conversation(fresh.id).unwrap().is_some());
        assert!(store.get_conversation(other_user.id).unwrap().is_some());
    }
}
