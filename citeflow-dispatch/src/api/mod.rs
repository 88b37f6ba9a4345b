//! HTTP adapter for the client-facing status surface
//!
//! Embedding applications mount [`build_router`] next to their own routes.

pub mod error;
pub mod health;
pub mod status;

pub use error::{ApiError, ApiResult};
pub use health::health_routes;
pub use status::{get_results, get_status};

use crate::Dispatcher;
use axum::Router;
use std::sync::Arc;

/// State shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Build the status router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/requests/:request_id/status", get(get_status))
        .route("/requests/:request_id/results", get(get_results))
        .merge(health_routes())
        .with_state(state)
}
