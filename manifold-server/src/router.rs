//! Route table

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::gateway;
use crate::state::AppState;

/// Build the gateway router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp/{upstream_id}",
            post(gateway::mcp_post)
                .get(gateway::mcp_get)
                .delete(gateway::mcp_delete),
        )
        .route("/health", get(gateway::health))
        .route("/stats", get(gateway::stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
