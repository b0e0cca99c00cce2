use super::handlers::{comments, health, method_not_allowed};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// The timeout bounds how long a client waits. A publish that is already
/// running in the worker still completes after the response is gone.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route(
            "/health",
            get(health::health).fallback(method_not_allowed),
        )
        .route(
            "/comment",
            post(comments::submit_comment).fallback(method_not_allowed),
        )
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
