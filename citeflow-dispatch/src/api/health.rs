//! Liveness endpoint

use super::AppState;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

const MODULE_NAME: &str = "citeflow-dispatch";

/// GET /health
///
/// Answers without touching the store, so it stays up while the database
/// is busy.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": MODULE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
