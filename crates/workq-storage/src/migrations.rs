//! Database schema migrations.
//!
//! Tables map onto the logical key schema:
//! - `conversations` holds `conversation:{id}` records,
//! - `conversation_messages` is the `conversation:{id}:messages` log,
//!   ordered by `(timestamp_ms, seq)`,
//! - `idx_conversations_user` serves `user:{email}:conversations`,
//! - `rate_limits` holds fixed-window usage counters.

use rusqlite::Connection;
use tracing::info;

use workq_core::error::WorkqError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), WorkqError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| WorkqError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| WorkqError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: conversations");
    }

    Ok(())
}

/// Version 1: conversations, message log, rate limits.
fn apply_v1(conn: &Connection) -> Result<(), WorkqError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id                   TEXT PRIMARY KEY NOT NULL,
            user_id              TEXT NOT NULL,
            title                TEXT NOT NULL,
            created_at           INTEGER NOT NULL,
            updated_at           INTEGER NOT NULL,
            message_count        INTEGER NOT NULL DEFAULT 0,
            model                TEXT,
            total_tokens         INTEGER NOT NULL DEFAULT 0,
            last_message_preview TEXT,
            metadata             TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations (user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS conversation_messages (
            seq              INTEGER PRIMARY KEY AUTOINCREMENT,
            id               TEXT NOT NULL UNIQUE,
            conversation_id  TEXT NOT NULL
                             REFERENCES conversations (id) ON DELETE CASCADE,
            role             TEXT NOT NULL
                             CHECK (role IN ('user', 'assistant', 'system')),
            content          TEXT NOT NULL,
            timestamp_ms     INTEGER NOT NULL,
            metadata         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation_time
            ON conversation_messages (conversation_id, timestamp_ms, seq);

        CREATE TABLE IF NOT EXISTS rate_limits (
            key            TEXT PRIMARY KEY NOT NULL,
            count          INTEGER NOT NULL,
            window_expiry  INTEGER NOT NULL
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'conversations');
        ",
    )
    .map_err(|e| WorkqError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
