//! HTTP + WebSocket surface: the `/ws` upgrade route plus the operational
//! `/health`, `/cluster`, `/stats` endpoints, all backed by state the node
//! manager, router and services already maintain.

pub mod handlers;
pub mod state;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/cluster", get(handlers::cluster_info))
        .route("/stats", get(handlers::stats))
        .route("/ws", get(handlers::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
