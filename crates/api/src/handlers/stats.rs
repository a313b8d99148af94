use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use laminar_core::stats::EngineStatsSnapshot;
use serde::Serialize;

use crate::error::AppResult;
use crate::gateway::GatewayStats;
use crate::response::DataResponse;
use crate::state::AppState;

/// Combined counters for both dispatch tiers.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub engine: EngineStatsSnapshot,
    pub gateway: GatewayStats,
}

/// GET /api/v1/engine/stats
pub async fn engine_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: StatsResponse {
            engine: state.engine.stats(),
            gateway: state.gateway.stats(),
        },
    }))
}
