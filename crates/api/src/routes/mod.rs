pub mod health;
pub mod query;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// POST /query
/// GET  /engine/stats
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().merge(query::router())
}
