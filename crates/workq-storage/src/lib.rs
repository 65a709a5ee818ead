//! workq storage crate - SQLite persistence for conversations and usage counters.
//!
//! Provides a WAL-mode SQLite database with migrations, the conversation
//! context store (append-only message logs with derived conversation
//! metadata), and fixed-window rate-limit counters.

pub mod conversations;
pub mod db;
pub mod migrations;
pub mod rate_limits;

pub use conversations::{derive_title, ConversationStore, DEFAULT_TITLE};
pub use db::Database;
pub use rate_limits::RateLimitStore;
