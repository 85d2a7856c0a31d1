//! HTTP API handlers and routing.

mod content;
pub mod error;
mod health;

use axum::Router;
use tower_http::{services::ServeDir, trace::TraceLayer};

pub use content::RetrieveRequest;
pub use health::{CacheHealth, HealthResponse};

use crate::state::AppState;

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Raw view of the content directories.
    let update = ServeDir::new(state.content().base_path());

    Router::new()
        .merge(health::routes())
        .merge(content::routes())
        .nest_service("/update", update)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
