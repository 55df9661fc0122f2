//! HTTP routes

pub mod health;
pub mod realtime;
pub mod sync;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_push_bytes = state.config().sync.max_push_bytes;

    Router::new()
        .nest("/health", health::router())
        .nest("/sync", sync::router(max_push_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
