//! Handler for the query dispatch endpoint.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use laminar_core::QueryRequest;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/query`.
///
/// Field names follow the existing client wire format; snake_case aliases
/// are accepted as well.
#[derive(Debug, Deserialize)]
pub struct QueryBody {
    #[serde(rename = "QueryId", alias = "query_id", default)]
    pub query_id: String,
    #[serde(rename = "QuerySQL", alias = "query_sql", default)]
    pub query_sql: String,
    /// Opaque payload; its UTF-8 bytes are handed to the executor.
    #[serde(rename = "Payload", alias = "payload", default)]
    pub payload: String,
}

impl QueryBody {
    fn into_request(self) -> AppResult<QueryRequest> {
        if self.query_id.trim().is_empty() && self.query_sql.trim().is_empty() {
            return Err(AppError::BadRequest(
                "QueryId or QuerySQL is required".to_string(),
            ));
        }
        Ok(QueryRequest::new(self.query_id, self.query_sql).with_payload(self.payload.into_bytes()))
    }
}

/// POST /api/v1/query
///
/// Dispatch a query through the gateway tier and return the response
/// addressed to this request's `QueryId`.
pub async fn execute_query(
    State(state): State<AppState>,
    body: Result<Json<QueryBody>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = body.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let request = body.into_request()?;

    tracing::debug!(query_id = %request.query_id, "Dispatching query");
    let response = state.gateway.handle(request).await?;
    Ok(Json(DataResponse { data: response }))
}
