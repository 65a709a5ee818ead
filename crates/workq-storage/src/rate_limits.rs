//! Fixed-window usage counters keyed by (operation, identity).
//!
//! Counters use a read-then-conditional-write pattern. Under heavy
//! concurrency two callers may both pass the check, so the ceiling is a
//! soft usage guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use workq_core::error::WorkqError;
use workq_core::types::RateLimitCounter;

use crate::db::{storage_err, Database};

/// Persistent rate-limit counters.
pub struct RateLimitStore {
    db: Arc<Database>,
}

impl RateLimitStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Storage key for one (operation, identity) pair.
    pub fn key(operation: &str, identity: &str) -> String {
        format!("ratelimit:{}:{}", operation, identity)
    }

    /// Count one call, rejecting it once `ceiling` calls were made in the
    /// current window.
    pub fn check_and_increment(
        &self,
        operation: &str,
        identity: &str,
        ceiling: u32,
        window: Duration,
    ) -> Result<RateLimitCounter, WorkqError> {
        self.check_and_increment_at(operation, identity, ceiling, window, Utc::now())
    }

    pub fn check_and_increment_at(
        &self,
        operation: &str,
        identity: &str,
        ceiling: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitCounter, WorkqError> {
        let key = Self::key(operation, identity);
        let now_ms = now.timestamp_millis();

        let existing = self.get(&key)?;
        let counter = match existing {
            Some(counter) if counter.window_expiry.timestamp_millis() > now_ms => {
                if counter.count >= ceiling {
                    let remaining_ms = counter.window_expiry.timestamp_millis() - now_ms;
                    let retry_after_secs = (remaining_ms.max(0) as u64).div_ceil(1000);
                    debug!(key = %key, count = counter.count, "Rate limit ceiling reached");
                    return Err(WorkqError::RateLimited {
                        operation: operation.to_string(),
                        retry_after_secs,
                    });
                }
                RateLimitCounter {
                    count: counter.count + 1,
                    ..counter
                }
            }
            _ => {
                let expiry_ms = now_ms + window.as_millis() as i64;
                RateLimitCounter {
                    key: key.clone(),
                    count: 1,
                    window_expiry: millis_to_datetime(expiry_ms)?,
                }
            }
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rate_limits (key, count, window_expiry) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET count = excluded.count,
                                                window_expiry = excluded.window_expiry",
                params![
                    counter.key,
                    counter.count,
                    counter.window_expiry.timestamp_millis()
                ],
            )
            .map_err(|e| WorkqError::Storage(format!("Failed to write rate limit: {}", e)))?;
            Ok(())
        })?;

        Ok(counter)
    }

    /// Current counter for a key, expired or not.
    pub fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, WorkqError> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT key, count, window_expiry FROM rate_limits WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)
        })?;

        row.map(|(key, count, expiry)| {
            Ok(RateLimitCounter {
                key,
                count,
                window_expiry: millis_to_datetime(expiry)?,
            })
        })
        .transpose()
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, WorkqError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| WorkqError::Storage(format!("Invalid timestamp: {}", ms)))
}
