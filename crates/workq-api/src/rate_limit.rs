//! Per-identity usage ceilings.
//!
//! Counters live in the rate-limit store, one per (operation, email) pair
//! with a fixed window. A call past the ceiling is answered with 429 and a
//! message telling the user when to retry.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use workq_core::error::WorkqError;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::state::AppState;

pub const OP_CHAT: &str = "chat";
pub const OP_METADATA_REFRESH: &str = "metadata_refresh";

/// Count one call of `operation` for `identity`.
///
/// Storage failures are logged and let the call through; the ceiling is a
/// usage guard, not an access control.
pub fn check(state: &AppState, operation: &str, identity: &str) -> Result<(), ApiError> {
    let limits = &state.config.rate_limit;
    let ceiling = match operation {
        OP_METADATA_REFRESH => limits.metadata_refresh_per_window,
        _ => limits.chat_per_window,
    };
    let window = Duration::from_secs(limits.window_secs);

    match state
        .rate_limits
        .check_and_increment(operation, identity, ceiling, window)
    {
        Ok(_) => Ok(()),
        Err(err @ WorkqError::RateLimited { .. }) => {
            tracing::info!(operation, identity, "Rate limit exceeded");
            Err(err.into())
        }
        Err(e) => {
            tracing::warn!(operation, error = %e, "Rate limit check failed, allowing request");
            Ok(())
        }
    }
}

/// Middleware guarding the chat endpoint. Must run after [`require_auth`](crate::auth::require_auth).
pub async fn limit_chat(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(user) = req.extensions().get::<AuthenticatedUser>().cloned() else {
        return ApiError::Unauthorized("Missing session".to_string()).into_response();
    };
    match check(&state, OP_CHAT, &user.email) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
