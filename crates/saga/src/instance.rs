//! Saga instance state, rebuilt by folding logged transitions.

use chrono::{DateTime, Utc};
use common::InstanceId;
use saga_log::{LogEntry, SequenceNumber};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state::SagaState;
use crate::transition::{ActionKind, SagaTransition};

/// Identifies one invocation: which step, which direction, which try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlannedAttempt {
    pub kind: ActionKind,
    pub step_index: usize,
    pub attempt: u32,
}

impl PlannedAttempt {
    pub fn new(kind: ActionKind, step_index: usize, attempt: u32) -> Self {
        Self {
            kind,
            step_index,
            attempt,
        }
    }
}

impl std::fmt::Display for PlannedAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} step {} attempt {}",
            self.kind, self.step_index, self.attempt
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeResult {
    Success,
    Failure,
    Timeout,
}

impl OutcomeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeResult::Success => "success",
            OutcomeResult::Failure => "failure",
            OutcomeResult::Timeout => "timeout",
        }
    }
}

/// Record of one finished invocation attempt. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub step_name: String,
    pub attempt: u32,
    pub kind: ActionKind,
    pub result: OutcomeResult,
    pub error: Option<String>,
    /// Whether a failure may be retried. Timeouts are retryable.
    pub retryable: bool,
    pub payload: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.result == OutcomeResult::Success
    }

    pub fn matches(&self, kind: ActionKind, step_index: usize) -> bool {
        self.kind == kind && self.step_index == step_index
    }

    /// `"reserveInventory:success"` / `"reserveInventory:compensate:success"`.
    pub fn label(&self) -> String {
        match self.kind {
            ActionKind::Forward => format!("{}:{}", self.step_name, self.result.as_str()),
            ActionKind::Compensate => format!(
                "{}:{}:{}",
                self.step_name,
                self.kind.as_str(),
                self.result.as_str()
            ),
        }
    }
}

/// One saga execution.
///
/// Only ever changed through [`SagaInstance::apply`], which is pure and
/// deterministic, so an instance rebuilt from the log is identical to the
/// one the coordinator held before a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: InstanceId,
    saga_type: String,
    input: serde_json::Value,
    state: SagaState,
    step_index: usize,
    attempt: u32,
    outcomes: Vec<StepOutcome>,
    in_flight: Option<PlannedAttempt>,
    /// Next attempt number of a scheduled retry.
    retry_pending: Option<u32>,
    failure_reason: Option<String>,
    abandon_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sequence: SequenceNumber,
}

impl SagaInstance {
    /// Creates the instance described by a `SagaStarted` transition.
    pub fn from_started(
        id: InstanceId,
        transition: &SagaTransition,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let SagaTransition::SagaStarted {
            saga_type, input, ..
        } = transition
        else {
            return Err(SagaError::CorruptHistory(format!(
                "instance {id} must begin with SagaStarted, found {}",
                transition.entry_type()
            )));
        };

        Ok(Self {
            id,
            saga_type: saga_type.clone(),
            input: input.clone(),
            state: SagaState::Pending,
            step_index: 0,
            attempt: 0,
            outcomes: Vec::new(),
            in_flight: None,
            retry_pending: None,
            failure_reason: None,
            abandon_reason: None,
            created_at: at,
            updated_at: at,
            sequence: SequenceNumber::first(),
        })
    }

    /// Rebuilds an instance from its log entries, oldest first.
    pub fn replay(entries: &[LogEntry]) -> Result<Self> {
        let (first, rest) = entries
            .split_first()
            .ok_or_else(|| SagaError::CorruptHistory("empty history".to_string()))?;

        if first.sequence != SequenceNumber::first() {
            return Err(SagaError::CorruptHistory(format!(
                "instance {} history starts at sequence {}",
                first.instance_id, first.sequence
            )));
        }

        let started: SagaTransition = serde_json::from_value(first.payload.clone())?;
        let mut instance = Self::from_started(first.instance_id, &started, first.timestamp)?;

        for entry in rest {
            if entry.instance_id != instance.id {
                return Err(SagaError::CorruptHistory(format!(
                    "entry {} belongs to instance {}, not {}",
                    entry.entry_id, entry.instance_id, instance.id
                )));
            }
            if entry.sequence != instance.sequence.next() {
                return Err(SagaError::CorruptHistory(format!(
                    "instance {} expected sequence {}, found {}",
                    instance.id,
                    instance.sequence.next(),
                    entry.sequence
                )));
            }
            let transition: SagaTransition = serde_json::from_value(entry.payload.clone())?;
            instance.apply(&transition, entry.timestamp);
        }

        Ok(instance)
    }

    /// Applies a transition that has been durably recorded.
    ///
    /// Advances the sequence by one. Transitions arriving after a terminal
    /// state only advance the sequence.
    pub fn apply(&mut self, transition: &SagaTransition, at: DateTime<Utc>) {
        self.sequence = self.sequence.next();
        if self.state.is_terminal() {
            return;
        }
        self.updated_at = at;

        match transition {
            SagaTransition::SagaStarted { .. } => {}
            SagaTransition::StepStarted {
                kind,
                step_index,
                attempt,
                ..
            } => {
                self.state = match kind {
                    ActionKind::Forward => SagaState::StepRunning(*step_index),
                    ActionKind::Compensate => SagaState::CompensatingRunning(*step_index),
                };
                self.step_index = *step_index;
                self.attempt = *attempt;
                self.retry_pending = None;
                self.in_flight = Some(PlannedAttempt::new(*kind, *step_index, *attempt));
            }
            SagaTransition::StepSucceeded {
                kind,
                step_index,
                step_name,
                attempt,
                payload,
            } => {
                self.in_flight = None;
                self.outcomes.push(StepOutcome {
                    step_index: *step_index,
                    step_name: step_name.clone(),
                    attempt: *attempt,
                    kind: *kind,
                    result: OutcomeResult::Success,
                    error: None,
                    retryable: false,
                    payload: Some(payload.clone()),
                    timestamp: at,
                });
            }
            SagaTransition::StepFailed {
                kind,
                step_index,
                step_name,
                attempt,
                error,
                retryable,
            } => {
                self.in_flight = None;
                self.outcomes.push(StepOutcome {
                    step_index: *step_index,
                    step_name: step_name.clone(),
                    attempt: *attempt,
                    kind: *kind,
                    result: OutcomeResult::Failure,
                    error: Some(error.clone()),
                    retryable: *retryable,
                    payload: None,
                    timestamp: at,
                });
            }
            SagaTransition::StepTimedOut {
                kind,
                step_index,
                step_name,
                attempt,
            } => {
                self.in_flight = None;
                self.outcomes.push(StepOutcome {
                    step_index: *step_index,
                    step_name: step_name.clone(),
                    attempt: *attempt,
                    kind: *kind,
                    result: OutcomeResult::Timeout,
                    error: Some("step timed out".to_string()),
                    retryable: true,
                    payload: None,
                    timestamp: at,
                });
            }
            SagaTransition::RetryScheduled { next_attempt, .. } => {
                self.retry_pending = Some(*next_attempt);
            }
            SagaTransition::CompensationStarted {
                failed_step,
                reason,
            } => {
                self.state = SagaState::CompensatingRunning(*failed_step);
                self.step_index = *failed_step;
                self.attempt = 0;
                self.in_flight = None;
                self.retry_pending = None;
                self.failure_reason = Some(reason.clone());
            }
            SagaTransition::SagaCompleted => {
                self.state = SagaState::Completed;
            }
            SagaTransition::SagaCompensated => {
                self.state = SagaState::Compensated;
            }
            SagaTransition::CompensationFailed { reason, .. } => {
                self.state = SagaState::CompensationFailed;
                self.failure_reason = Some(reason.clone());
            }
            SagaTransition::SagaAbandoned { reason } => {
                self.state = SagaState::Abandoned;
                self.in_flight = None;
                self.retry_pending = None;
                self.abandon_reason = Some(reason.clone());
            }
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Index of the step currently executed or compensated.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// Attempt number of the current step, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Every finished attempt, in the order it was recorded.
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// The attempt announced in the log whose result is not recorded yet.
    pub fn in_flight(&self) -> Option<PlannedAttempt> {
        self.in_flight
    }

    pub fn retry_pending(&self) -> Option<u32> {
        self.retry_pending
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn abandon_reason(&self) -> Option<&str> {
        self.abandon_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Sequence of the last applied log entry.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn last_outcome(&self) -> Option<&StepOutcome> {
        self.outcomes.last()
    }

    pub fn forward_succeeded(&self, step_index: usize) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.matches(ActionKind::Forward, step_index) && o.is_success())
    }

    pub fn compensated(&self, step_index: usize) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.matches(ActionKind::Compensate, step_index) && o.is_success())
    }

    /// Successful forward payloads for steps `0..step_count`.
    pub fn prior_results(&self, step_count: usize) -> Vec<Option<serde_json::Value>> {
        (0..step_count)
            .map(|i| {
                self.outcomes
                    .iter()
                    .rev()
                    .find(|o| o.matches(ActionKind::Forward, i) && o.is_success())
                    .and_then(|o| o.payload.clone())
            })
            .collect()
    }

    /// Outcome labels in recorded order, e.g. `["reserveInventory:success"]`.
    pub fn outcome_labels(&self) -> Vec<String> {
        self.outcomes.iter().map(StepOutcome::label).collect()
    }
}
