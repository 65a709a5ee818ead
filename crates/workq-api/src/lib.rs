//! workq API crate - axum HTTP server and route handlers.
//!
//! Exposes the query pipeline (`/chat`), conversation management, the
//! metadata cache and read-only collection listings behind bearer-token
//! authentication, plus a public health check.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use auth::AuthenticatedUser;
pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
