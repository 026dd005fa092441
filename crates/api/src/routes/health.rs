//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_log::SagaLog;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_instances: usize,
}

/// GET /health: returns system health status.
pub async fn check<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_instances: state.coordinator.active_instances().len(),
    })
}
