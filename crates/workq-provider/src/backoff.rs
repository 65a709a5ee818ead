//! Backoff policy and request deadline.
//!
//! One [`BackoffPolicy`] drives every retry loop in the workspace. The
//! [`Deadline`] travels with each call so that no retry or backoff sleep
//! extends past the request's wall-clock budget.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use workq_core::config::RetryConfig;

use crate::error::{ErrorClass, ProviderError};

/// Absolute point in time by which a request must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Cap a per-call timeout to the remaining budget.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }
}

/// Exponential backoff with jitter.
///
/// The delay before retry `n` (0-based) is `base_delay * 2^n`, capped at
/// `max_delay`, plus a uniform random jitter in `[0, jitter]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl BackoffPolicy {
    /// Same policy with a different retry ceiling.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// Exponential component of the delay before retry `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }

    /// Delay before the next attempt, or `None` when no retry should run.
    ///
    /// Permanent errors and exhausted attempts never retry. A server
    /// `Retry-After` longer than the computed backoff wins. A delay that
    /// would not leave time for another attempt before the deadline yields
    /// `None`.
    pub fn next_delay(
        &self,
        attempt: u32,
        class: ErrorClass,
        deadline: &Deadline,
    ) -> Option<Duration> {
        if !class.is_retryable() || attempt >= self.max_retries {
            return None;
        }

        let mut delay = self.base_delay_for(attempt) + self.jitter();
        if let ErrorClass::RateLimited {
            retry_after: Some(retry_after),
        } = class
        {
            delay = delay.max(retry_after);
        }

        if delay >= deadline.remaining() {
            return None;
        }
        Some(delay)
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts
    /// or the deadline passes.
    ///
    /// Non-idempotent operations run exactly once.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        idempotent: bool,
        deadline: &Deadline,
        mut op: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            if deadline.is_expired() {
                return Err(ProviderError::DeadlineExceeded(label.to_string()));
            }

            let result = match tokio::time::timeout(deadline.remaining(), op(attempt)).await {
                Ok(result) => result,
                Err(_) => return Err(ProviderError::DeadlineExceeded(label.to_string())),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !idempotent {
                debug!(label, error = %err, "Not retrying non-idempotent call");
                return Err(err);
            }

            match self.next_delay(attempt, err.class(), deadline) {
                Some(delay) => {
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after upstream error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }
}
