//! Saga lifecycle endpoints: start, status, abandon and log inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::InstanceId;
use saga::{InMemoryStepInvoker, SagaCoordinator, SagaInstance, StepOutcome};
use saga_log::{LogEntry, SagaLog};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<L: SagaLog> {
    pub coordinator: SagaCoordinator<L, InMemoryStepInvoker>,
}

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Deserialize, Default)]
pub struct AbandonRequest {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStartedResponse {
    pub instance_id: String,
    pub state: String,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub instance_id: String,
    pub saga_type: String,
    pub state: String,
    pub step_index: Option<usize>,
    pub attempt: u32,
    pub outcomes: Vec<StepOutcomeResponse>,
    pub failure_reason: Option<String>,
    pub abandon_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct StepOutcomeResponse {
    pub step_index: usize,
    pub step_name: String,
    pub kind: String,
    pub attempt: u32,
    pub result: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct LogEntryResponse {
    pub sequence: i64,
    pub entry_type: String,
    pub state: String,
    pub step_index: Option<usize>,
    pub terminal: bool,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl From<&StepOutcome> for StepOutcomeResponse {
    fn from(outcome: &StepOutcome) -> Self {
        Self {
            step_index: outcome.step_index,
            step_name: outcome.step_name.clone(),
            kind: outcome.kind.as_str().to_string(),
            attempt: outcome.attempt,
            result: outcome.result.as_str().to_string(),
            error: outcome.error.clone(),
            timestamp: outcome.timestamp,
        }
    }
}

impl From<&SagaInstance> for SagaStatusResponse {
    fn from(instance: &SagaInstance) -> Self {
        let state = instance.state();
        Self {
            instance_id: instance.id().to_string(),
            saga_type: instance.saga_type().to_string(),
            state: state.as_str().to_string(),
            step_index: state.step_index(),
            attempt: instance.attempt(),
            outcomes: instance.outcomes().iter().map(Into::into).collect(),
            failure_reason: instance.failure_reason().map(str::to_string),
            abandon_reason: instance.abandon_reason().map(str::to_string),
            created_at: instance.created_at(),
            updated_at: instance.updated_at(),
        }
    }
}

impl From<LogEntry> for LogEntryResponse {
    fn from(entry: LogEntry) -> Self {
        Self {
            sequence: entry.sequence.as_i64(),
            entry_type: entry.entry_type,
            state: entry.state,
            step_index: entry.step_index,
            terminal: entry.terminal,
            timestamp: entry.timestamp,
            payload: entry.payload,
        }
    }
}

// -- Handlers --

/// POST /sagas: starts a new saga instance.
#[tracing::instrument(skip(state, req), fields(saga_type = %req.saga_type))]
pub async fn start<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    let receipt = state.coordinator.start(&req.saga_type, req.input).await?;

    Ok((
        StatusCode::CREATED,
        Json(SagaStartedResponse {
            instance_id: receipt.instance_id.to_string(),
            state: receipt.state.as_str().to_string(),
        }),
    ))
}

/// GET /sagas/{id}: returns the current status of an instance.
#[tracing::instrument(skip(state))]
pub async fn get<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let instance = state.coordinator.status(instance_id).await?;
    Ok(Json(SagaStatusResponse::from(&instance)))
}

/// POST /sagas/{id}/abandon: stops an instance without further compensation.
///
/// The body is optional; without a reason a generic one is recorded.
#[tracing::instrument(skip(state, body))]
pub async fn abandon<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
    body: Option<Json<AbandonRequest>>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "abandoned by operator".to_string());

    let instance = state.coordinator.abandon(instance_id, reason).await?;
    Ok(Json(SagaStatusResponse::from(&instance)))
}

/// GET /sagas/{id}/log: returns the raw log entries of an instance.
#[tracing::instrument(skip(state))]
pub async fn log<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogEntryResponse>>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let entries = state.coordinator.history(instance_id).await?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

fn parse_instance_id(id: &str) -> Result<InstanceId, ApiError> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid instance ID: {id}")))
}
