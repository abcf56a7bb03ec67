use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Question answering
            .route("/nl-query", post(handlers::api::nl_query))
            // Conversations
            .route("/sessions/{id}/history", get(handlers::api::session_history))
            // Schema management
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
