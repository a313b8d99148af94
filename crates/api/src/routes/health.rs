use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Number of running shard workers.
    pub shards: usize,
}

/// GET /health -- returns service status and shard count.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        shards: state.engine.shard_count(),
    })
}

/// GET /ping -- liveness probe.
async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ping", get(ping))
}
