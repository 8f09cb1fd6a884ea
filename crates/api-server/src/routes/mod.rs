//! Route handlers

pub mod health;
pub mod sessions;
pub mod stream;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full HTTP surface with shared layers applied.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(sessions::router())
        .merge(stream::router())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
