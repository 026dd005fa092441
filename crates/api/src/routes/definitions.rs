//! Registered saga definitions.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::{SagaDefinition, StepDefinition};
use saga_log::SagaLog;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct DefinitionResponse {
    pub saga_type: String,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub name: String,
    pub action: String,
    pub compensation: Option<String>,
    pub timeout_ms: u128,
    pub max_attempts: u32,
}

impl From<&StepDefinition> for StepResponse {
    fn from(step: &StepDefinition) -> Self {
        Self {
            name: step.name.clone(),
            action: step.forward.name(),
            compensation: step.compensation.as_ref().map(|c| c.name()),
            timeout_ms: step.timeout.as_millis(),
            max_attempts: step.retry.max_attempts,
        }
    }
}

impl From<&SagaDefinition> for DefinitionResponse {
    fn from(definition: &SagaDefinition) -> Self {
        Self {
            saga_type: definition.name().to_string(),
            steps: definition.steps().iter().map(Into::into).collect(),
        }
    }
}

/// GET /definitions: lists saga types with their steps.
pub async fn list<L: SagaLog + 'static>(
    State(state): State<Arc<AppState<L>>>,
) -> Json<Vec<DefinitionResponse>> {
    let registry = state.coordinator.registry();
    let definitions = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.lookup(name).ok())
        .map(|definition| DefinitionResponse::from(definition.as_ref()))
        .collect();
    Json(definitions)
}
