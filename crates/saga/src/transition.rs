//! Logged saga transitions.
//!
//! Each variant is one entry in the saga log. Replaying an instance's
//! transitions in sequence order reproduces its state exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Forward,
    Compensate,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Forward => "forward",
            ActionKind::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable state transition of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaTransition {
    /// Instance created.
    SagaStarted {
        saga_type: String,
        input: serde_json::Value,
        started_at: DateTime<Utc>,
    },

    /// An attempt is about to be invoked. Written before the invocation.
    StepStarted {
        kind: ActionKind,
        step_index: usize,
        step_name: String,
        attempt: u32,
    },

    StepSucceeded {
        kind: ActionKind,
        step_index: usize,
        step_name: String,
        attempt: u32,
        payload: serde_json::Value,
    },

    StepFailed {
        kind: ActionKind,
        step_index: usize,
        step_name: String,
        attempt: u32,
        error: String,
        retryable: bool,
    },

    /// No answer arrived before the step deadline.
    StepTimedOut {
        kind: ActionKind,
        step_index: usize,
        step_name: String,
        attempt: u32,
    },

    /// The failed attempt will be retried after a backoff.
    RetryScheduled {
        kind: ActionKind,
        step_index: usize,
        next_attempt: u32,
        delay_ms: u64,
    },

    /// Forward execution gave up at `failed_step`; rolling back begins.
    CompensationStarted { failed_step: usize, reason: String },

    SagaCompleted,

    SagaCompensated,

    /// A compensating action could not be applied.
    CompensationFailed { step_index: usize, reason: String },

    /// Stopped by an operator; no further compensation runs.
    SagaAbandoned { reason: String },
}

impl SagaTransition {
    /// Stable transition name stored alongside the payload.
    pub fn entry_type(&self) -> &'static str {
        match self {
            SagaTransition::SagaStarted { .. } => "SagaStarted",
            SagaTransition::StepStarted { .. } => "StepStarted",
            SagaTransition::StepSucceeded { .. } => "StepSucceeded",
            SagaTransition::StepFailed { .. } => "StepFailed",
            SagaTransition::StepTimedOut { .. } => "StepTimedOut",
            SagaTransition::RetryScheduled { .. } => "RetryScheduled",
            SagaTransition::CompensationStarted { .. } => "CompensationStarted",
            SagaTransition::SagaCompleted => "SagaCompleted",
            SagaTransition::SagaCompensated => "SagaCompensated",
            SagaTransition::CompensationFailed { .. } => "CompensationFailed",
            SagaTransition::SagaAbandoned { .. } => "SagaAbandoned",
        }
    }

    /// Whether this transition ends the instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaTransition::SagaCompleted
                | SagaTransition::SagaCompensated
                | SagaTransition::CompensationFailed { .. }
                | SagaTransition::SagaAbandoned { .. }
        )
    }

    /// The step this transition refers to, if any.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            SagaTransition::StepStarted { step_index, .. }
            | SagaTransition::StepSucceeded { step_index, .. }
            | SagaTransition::StepFailed { step_index, .. }
            | SagaTransition::StepTimedOut { step_index, .. }
            | SagaTransition::RetryScheduled { step_index, .. }
            | SagaTransition::CompensationFailed { step_index, .. } => Some(*step_index),
            SagaTransition::CompensationStarted { failed_step, .. } => Some(*failed_step),
            SagaTransition::SagaStarted { .. }
            | SagaTransition::SagaCompleted
            | SagaTransition::SagaCompensated
            | SagaTransition::SagaAbandoned { .. } => None,
        }
    }

    pub fn saga_started(saga_type: impl Into<String>, input: serde_json::Value) -> Self {
        SagaTransition::SagaStarted {
            saga_type: saga_type.into(),
            input,
            started_at: Utc::now(),
        }
    }
}
