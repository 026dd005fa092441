//! Step invoker interface.
//!
//! The coordinator never performs business actions itself. It hands an
//! [`Invocation`] to a [`StepInvoker`] and records whatever comes back.

mod memory;

pub use memory::InMemoryStepInvoker;

use async_trait::async_trait;
use common::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::ActionDescriptor;
use crate::instance::PlannedAttempt;
use crate::transition::ActionKind;

/// Everything an invoker needs to carry out one attempt of one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub instance_id: InstanceId,
    pub saga_type: String,
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub kind: ActionKind,
    pub action: ActionDescriptor,
    /// The input the saga was started with.
    pub input: serde_json::Value,
    /// Payloads of successful forward actions, indexed by step.
    pub prior_results: Vec<Option<serde_json::Value>>,
}

impl Invocation {
    /// Idempotency key of this attempt.
    ///
    /// A recovered coordinator re-sends an attempt with the same key, so
    /// invokers must apply each key's effect at most once.
    pub fn attempt_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.instance_id, self.kind, self.step_index, self.attempt
        )
    }

    pub fn planned(&self) -> PlannedAttempt {
        PlannedAttempt::new(self.kind, self.step_index, self.attempt)
    }
}

/// An action that returned an error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{detail}")]
pub struct StepFailure {
    /// `false` for business rejections that no retry can fix.
    pub retryable: bool,
    pub detail: String,
}

impl StepFailure {
    /// A failure worth retrying, such as a network error.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            retryable: true,
            detail: detail.into(),
        }
    }

    /// A definitive rejection; compensation starts immediately.
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            retryable: false,
            detail: detail.into(),
        }
    }
}

/// Carries out forward and compensating actions.
///
/// Timeouts are not reported by the invoker: an invocation that does not
/// return before the step deadline is treated as timed out and dropped.
/// Implementations must be idempotent per [`Invocation::attempt_key`].
#[async_trait]
pub trait StepInvoker: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<serde_json::Value, StepFailure>;
}
