use std::sync::Arc;

use laminar_core::ComputeEngine;

use crate::config::ServerConfig;
use crate::gateway::Gateway;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// The sharded dispatch engine.
    pub engine: Arc<ComputeEngine>,
    /// Outer cache and coalescing tier wrapping `engine`.
    pub gateway: Arc<Gateway>,
}
