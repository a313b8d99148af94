use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{query, stats};
use crate::state::AppState;

/// Query dispatch routes.
///
/// ```text
/// POST /query          -> execute_query
/// GET  /engine/stats   -> engine_stats
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/query", post(query::execute_query))
        .route("/engine/stats", get(stats::engine_stats))
}
