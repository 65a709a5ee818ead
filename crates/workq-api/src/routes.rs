//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! session authentication and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use workq_core::config::WorkqConfig;
use workq_core::error::WorkqError;

use crate::handlers;
use crate::state::AppState;

fn cors_layer(port: u16) -> CorsLayer {
    // Allow the local UI on the configured port plus port+1 for a dev server.
    let dev_port = port.saturating_add(1);
    let origins: Vec<HeaderValue> = [port, dev_port]
        .into_iter()
        .flat_map(|p| [format!("http://127.0.0.1:{}", p), format!("http://localhost:{}", p)])
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
}

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.general.port);

    // Routes that do NOT require authentication.
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route(
            "/chat",
            post(handlers::chat).layer(from_fn_with_state(
                state.clone(),
                crate::rate_limit::limit_chat,
            )),
        )
        .route(
            "/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route("/conversations/bulk-delete", post(handlers::bulk_delete))
        .route("/conversations/cleanup", post(handlers::cleanup))
        .route(
            "/conversations/{id}",
            get(handlers::get_conversation)
                .patch(handlers::update_conversation)
                .delete(handlers::delete_conversation),
        )
        .route(
            "/conversations/{id}/context",
            get(handlers::context_stats).delete(handlers::clear_context),
        )
        .route(
            "/metadata",
            get(handlers::metadata_stats).post(handlers::metadata_action),
        )
        .route("/collections/{kind}", get(handlers::collection))
        .route_layer(from_fn_with_state(state.clone(), crate::auth::require_auth));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Binds to 127.0.0.1 (localhost only) on the port from config.
pub async fn start_server(config: &WorkqConfig, state: AppState) -> Result<(), WorkqError> {
    let addr = format!("127.0.0.1:{}", config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
