//! Declarative saga definitions.
//!
//! A definition is an ordered list of steps, each pairing a forward action
//! with an optional compensating action. Actions are plain descriptors; only
//! the step invoker knows how to carry them out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::retry::RetryPolicy;

/// Default deadline for a single step invocation.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// What the step invoker should do, independent of transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Call an HTTP endpoint.
    HttpCall {
        method: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    /// Publish a message to a queue or topic.
    QueuePublish {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<serde_json::Value>,
    },
    /// An action the invoker resolves by name.
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
}

impl ActionDescriptor {
    pub fn http(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self::HttpCall {
            method: method.into(),
            url: url.into(),
            body: None,
        }
    }

    pub fn publish(topic: impl Into<String>) -> Self {
        Self::QueuePublish {
            topic: topic.into(),
            message: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            name: name.into(),
            params: None,
        }
    }

    /// Short human-readable label, used in logs.
    pub fn name(&self) -> String {
        match self {
            Self::HttpCall { method, url, .. } => format!("{method} {url}"),
            Self::QueuePublish { topic, .. } => format!("publish {topic}"),
            Self::Named { name, .. } => name.clone(),
        }
    }
}

/// One step of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub forward: ActionDescriptor,
    /// `None` means rolling back this step is a no-op.
    pub compensation: Option<ActionDescriptor>,
    /// Deadline for each individual attempt.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Policy for the compensating action; falls back to `retry`.
    pub compensation_retry: Option<RetryPolicy>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, forward: ActionDescriptor) -> Self {
        Self {
            name: name.into(),
            forward,
            compensation: None,
            timeout: DEFAULT_STEP_TIMEOUT,
            retry: RetryPolicy::none(),
            compensation_retry: None,
        }
    }

    pub fn compensate_with(mut self, compensation: ActionDescriptor) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Some(policy);
        self
    }

    pub fn compensation_policy(&self) -> &RetryPolicy {
        self.compensation_retry.as_ref().unwrap_or(&self.retry)
    }

    pub fn is_compensable(&self) -> bool {
        self.compensation.is_some()
    }
}

/// An immutable, named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Indexes of steps after the first that cannot be rolled back.
    ///
    /// Once one of these has succeeded, a later failure leaves the saga
    /// partially applied.
    pub fn irreversible_steps(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, step)| !step.is_compensable())
            .map(|(index, _)| index)
            .collect()
    }

    /// Looks up a step, treating a missing index as a corrupt history.
    pub(crate) fn require_step(&self, index: usize) -> Result<&StepDefinition> {
        self.step(index).ok_or_else(|| {
            SagaError::CorruptHistory(format!(
                "step index {index} is out of range for saga type {} ({} steps)",
                self.name,
                self.steps.len()
            ))
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga type name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "{} has no steps",
                self.name
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "{} step {index} has an empty name",
                    self.name
                )));
            }
            if step.timeout.is_zero() {
                return Err(SagaError::InvalidDefinition(format!(
                    "{} step '{}' has a zero timeout",
                    self.name, step.name
                )));
            }
            for policy in [Some(&step.retry), step.compensation_retry.as_ref()]
                .into_iter()
                .flatten()
            {
                policy.validate().map_err(|reason| {
                    SagaError::InvalidDefinition(format!(
                        "{} step '{}': {reason}",
                        self.name, step.name
                    ))
                })?;
            }
        }
        Ok(())
    }
}

/// Builder for [`SagaDefinition`].
#[derive(Debug)]
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
}

impl SagaDefinitionBuilder {
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> SagaDefinition {
        SagaDefinition {
            name: self.name,
            steps: self.steps,
        }
    }
}
