//! API Handlers
//!
//! HTTP request handlers for each diagnostics endpoint.

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::cache::CleanupStats;
use crate::client::{DataClient, DiagnosticsSnapshot};
use crate::error::{DataError, Result};
use crate::loader::LoadProgress;
use crate::models::{
    CancelResponse, EmergencyClearRequest, EmergencyClearResponse, HealthResponse, LoadRequest,
    LoadResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<DataClient>,
}

impl AppState {
    pub fn new(client: DataClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

/// Handler for POST /load
///
/// Runs a foreground load. Cancelled and failed loads are reported in the
/// body; only malformed requests are HTTP errors.
pub async fn load_handler(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadResponse>> {
    req.validate()?;
    let outcome = state.client.load(req).await;
    Ok(Json(LoadResponse::from(outcome)))
}

/// Handler for POST /cancel
pub async fn cancel_handler(State(state): State<AppState>) -> Json<CancelResponse> {
    state.client.cancel();
    Json(CancelResponse::new())
}

/// Handler for GET /progress
pub async fn progress_handler(State(state): State<AppState>) -> Json<LoadProgress> {
    Json(state.client.progress())
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<DiagnosticsSnapshot> {
    Json(state.client.stats().await)
}

/// Handler for POST /maintenance/cleanup
pub async fn cleanup_handler(State(state): State<AppState>) -> Json<CleanupStats> {
    Json(state.client.global_cleanup().await)
}

/// Handler for POST /maintenance/emergency-clear
///
/// The external memory-pressure signal.
pub async fn emergency_clear_handler(
    State(state): State<AppState>,
    Json(req): Json<EmergencyClearRequest>,
) -> Result<Json<EmergencyClearResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(DataError::InvalidRequest(error_msg));
    }

    let removed = state.client.emergency_clear(req.target_reduction_percent).await;
    let remaining = state
        .client
        .stats()
        .await
        .registrations
        .iter()
        .map(|r| r.size)
        .sum();

    Ok(Json(EmergencyClearResponse { removed, remaining }))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
