//! API route modules.
//!
//! Organizes routes by resource type.

pub mod convert;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod upload;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api",
            Router::new()
                .merge(convert::router())
                .merge(jobs::router())
                .merge(upload::router()),
        )
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .with_state(state)
}
