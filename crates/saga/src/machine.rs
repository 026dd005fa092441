//! Saga state machine.
//!
//! [`decide`] looks at an instance and one event and says what to record and
//! what to do next. It performs no I/O: the coordinator appends the record,
//! carries out the effect and feeds the result back in as the next event.

use std::time::Duration;

use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError};
use crate::instance::{PlannedAttempt, SagaInstance, StepOutcome};
use crate::invoker::StepFailure;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::SagaState;
use crate::transition::{ActionKind, SagaTransition};

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// Nothing new happened; asks for the next action.
    Resume,
    /// The invocation of `attempt` returned.
    Finished {
        attempt: PlannedAttempt,
        result: std::result::Result<serde_json::Value, StepFailure>,
    },
    /// The deadline of `attempt` elapsed first.
    TimedOut { attempt: PlannedAttempt },
}

/// What the coordinator does after recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Invoke the step invoker for this attempt.
    Invoke(PlannedAttempt),
    /// Wait before the next decision (retry backoff).
    Sleep(Duration),
    /// Decide again immediately.
    Continue,
    /// Stop driving the instance.
    Halt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Transition to append before performing `effect`.
    pub record: Option<SagaTransition>,
    pub effect: Effect,
}

impl Decision {
    fn new(record: SagaTransition, effect: Effect) -> Self {
        Self {
            record: Some(record),
            effect,
        }
    }

    fn halt() -> Self {
        Self {
            record: None,
            effect: Effect::Halt,
        }
    }
}

/// Computes the next record and effect for `instance`.
///
/// Returns `StaleSignal` for a completion or timeout of an attempt that is
/// not in flight, which the caller discards. This makes the first of a
/// completion and a timeout authoritative and keeps a duplicate signal from
/// producing a second outcome.
pub fn decide(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    event: MachineEvent,
) -> Result<Decision> {
    match event {
        MachineEvent::Resume => next_action(definition, instance),
        MachineEvent::Finished { attempt, result } => {
            ensure_in_flight(instance, attempt)?;
            let step = definition.require_step(attempt.step_index)?;
            let record = match result {
                Ok(payload) => SagaTransition::StepSucceeded {
                    kind: attempt.kind,
                    step_index: attempt.step_index,
                    step_name: step.name.clone(),
                    attempt: attempt.attempt,
                    payload,
                },
                Err(failure) => SagaTransition::StepFailed {
                    kind: attempt.kind,
                    step_index: attempt.step_index,
                    step_name: step.name.clone(),
                    attempt: attempt.attempt,
                    error: failure.detail,
                    retryable: failure.retryable,
                },
            };
            Ok(Decision::new(record, Effect::Continue))
        }
        MachineEvent::TimedOut { attempt } => {
            ensure_in_flight(instance, attempt)?;
            let step = definition.require_step(attempt.step_index)?;
            Ok(Decision::new(
                SagaTransition::StepTimedOut {
                    kind: attempt.kind,
                    step_index: attempt.step_index,
                    step_name: step.name.clone(),
                    attempt: attempt.attempt,
                },
                Effect::Continue,
            ))
        }
    }
}

/// The transition recording an operator abandon request.
pub fn abandon(instance: &SagaInstance, reason: impl Into<String>) -> Result<SagaTransition> {
    if instance.is_terminal() {
        return Err(SagaError::AlreadyTerminal {
            instance_id: instance.id(),
            state: instance.state(),
        });
    }
    Ok(SagaTransition::SagaAbandoned {
        reason: reason.into(),
    })
}

fn ensure_in_flight(instance: &SagaInstance, attempt: PlannedAttempt) -> Result<()> {
    if instance.is_terminal() {
        return Err(SagaError::StaleSignal {
            instance_id: instance.id(),
            detail: format!("{attempt} arrived after the saga became {}", instance.state()),
        });
    }
    if instance.in_flight() != Some(attempt) {
        return Err(SagaError::StaleSignal {
            instance_id: instance.id(),
            detail: format!("{attempt} is not in flight"),
        });
    }
    Ok(())
}

fn next_action(definition: &SagaDefinition, instance: &SagaInstance) -> Result<Decision> {
    if instance.is_terminal() {
        return Ok(Decision::halt());
    }

    // Announced but never answered, e.g. before a crash. Re-drive it under
    // the same attempt key.
    if let Some(attempt) = instance.in_flight() {
        return Ok(Decision {
            record: None,
            effect: Effect::Invoke(attempt),
        });
    }

    match instance.state() {
        SagaState::Pending => start_attempt(definition, ActionKind::Forward, 0, 1),
        SagaState::StepRunning(index) => next_forward(definition, instance, index),
        SagaState::CompensatingRunning(index) => next_compensation(definition, instance, index),
        SagaState::Completed
        | SagaState::Compensated
        | SagaState::CompensationFailed
        | SagaState::Abandoned => Ok(Decision::halt()),
    }
}

fn next_forward(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    index: usize,
) -> Result<Decision> {
    if let Some(next_attempt) = instance.retry_pending() {
        return start_attempt(definition, ActionKind::Forward, index, next_attempt);
    }

    let step = definition.require_step(index)?;
    let outcome = last_outcome_of(instance, ActionKind::Forward, index)?;

    if outcome.is_success() {
        if index + 1 < definition.len() {
            return start_attempt(definition, ActionKind::Forward, index + 1, 1);
        }
        return Ok(Decision::new(SagaTransition::SagaCompleted, Effect::Halt));
    }

    let detail = outcome.error.clone().unwrap_or_default();
    match retry_decision(&step.retry, outcome) {
        RetryDecision::RetryAfter(delay) => Ok(schedule_retry(
            ActionKind::Forward,
            index,
            outcome.attempt,
            delay,
        )),
        RetryDecision::GiveUp => {
            let reason = if outcome.retryable {
                format!(
                    "{} failed after {} attempts: {detail}",
                    step.name, outcome.attempt
                )
            } else {
                format!("{} failed permanently: {detail}", step.name)
            };
            Ok(Decision::new(
                SagaTransition::CompensationStarted {
                    failed_step: index,
                    reason,
                },
                Effect::Continue,
            ))
        }
    }
}

fn next_compensation(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    index: usize,
) -> Result<Decision> {
    if let Some(next_attempt) = instance.retry_pending() {
        return start_attempt(definition, ActionKind::Compensate, index, next_attempt);
    }

    let outcome = instance
        .last_outcome()
        .filter(|o| o.matches(ActionKind::Compensate, index));

    let Some(outcome) = outcome else {
        // Compensation just began at the failed step.
        return compensate_from(definition, instance, Some(index));
    };

    if outcome.is_success() {
        return compensate_from(definition, instance, index.checked_sub(1));
    }

    let step = definition.require_step(index)?;
    match retry_decision(step.compensation_policy(), outcome) {
        RetryDecision::RetryAfter(delay) => Ok(schedule_retry(
            ActionKind::Compensate,
            index,
            outcome.attempt,
            delay,
        )),
        RetryDecision::GiveUp => Ok(Decision::new(
            SagaTransition::CompensationFailed {
                step_index: index,
                reason: format!(
                    "compensation of {} failed after {} attempts: {}",
                    step.name,
                    outcome.attempt,
                    outcome.error.clone().unwrap_or_default()
                ),
            },
            Effect::Halt,
        )),
    }
}

/// Starts compensating the highest step at or below `upper` that succeeded
/// forward, has a compensating action and is not compensated yet.
fn compensate_from(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    upper: Option<usize>,
) -> Result<Decision> {
    let target = upper.and_then(|upper| {
        (0..=upper).rev().find(|&k| {
            definition.step(k).is_some_and(StepDefinition::is_compensable)
                && instance.forward_succeeded(k)
                && !instance.compensated(k)
        })
    });

    match target {
        Some(k) => start_attempt(definition, ActionKind::Compensate, k, 1),
        None => Ok(Decision::new(SagaTransition::SagaCompensated, Effect::Halt)),
    }
}

fn start_attempt(
    definition: &SagaDefinition,
    kind: ActionKind,
    step_index: usize,
    attempt: u32,
) -> Result<Decision> {
    let step = definition.require_step(step_index)?;
    Ok(Decision::new(
        SagaTransition::StepStarted {
            kind,
            step_index,
            step_name: step.name.clone(),
            attempt,
        },
        Effect::Invoke(PlannedAttempt::new(kind, step_index, attempt)),
    ))
}

fn schedule_retry(kind: ActionKind, step_index: usize, attempt: u32, delay: Duration) -> Decision {
    Decision::new(
        SagaTransition::RetryScheduled {
            kind,
            step_index,
            next_attempt: attempt + 1,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        },
        Effect::Sleep(delay),
    )
}

/// Non-retryable failures skip the remaining budget.
fn retry_decision(policy: &RetryPolicy, outcome: &StepOutcome) -> RetryDecision {
    if !outcome.retryable {
        return RetryDecision::GiveUp;
    }
    policy.evaluate(outcome.attempt)
}

fn last_outcome_of(
    instance: &SagaInstance,
    kind: ActionKind,
    index: usize,
) -> Result<&StepOutcome> {
    instance
        .last_outcome()
        .filter(|o| o.matches(kind, index))
        .ok_or_else(|| {
            SagaError::CorruptHistory(format!(
                "instance {} is {} with no recorded {kind} outcome for step {index}",
                instance.id(),
                instance.state()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActionDescriptor, StepDefinition};
    use crate::instance::OutcomeResult;
    use chrono::Utc;
    use common::InstanceId;

    fn definition() -> SagaDefinition {
        SagaDefinition::builder("order-fulfillment")
            .step(
                StepDefinition::new("reserveInventory", ActionDescriptor::named("reserve"))
                    .compensate_with(ActionDescriptor::named("release")),
            )
            .step(
                StepDefinition::new("chargePayment", ActionDescriptor::named("charge"))
                    .compensate_with(ActionDescriptor::named("refund"))
                    .retry(RetryPolicy::exponential(3, Duration::from_millis(100))),
            )
            .step(
                StepDefinition::new("scheduleShipping", ActionDescriptor::named("ship"))
                    .compensate_with(ActionDescriptor::named("cancel")),
            )
            .build()
    }

    fn new_instance() -> SagaInstance {
        SagaInstance::from_started(
            InstanceId::new(),
            &SagaTransition::saga_started("order-fulfillment", serde_json::json!({"orderId": "O1"})),
            Utc::now(),
        )
        .unwrap()
    }

    /// Decides, applies the record and returns the effect.
    fn step(def: &SagaDefinition, instance: &mut SagaInstance, event: MachineEvent) -> Effect {
        let decision = decide(def, instance, event).unwrap();
        if let Some(record) = &decision.record {
            instance.apply(record, Utc::now());
        }
        decision.effect
    }

    fn invoke_expected(effect: Effect) -> PlannedAttempt {
        match effect {
            Effect::Invoke(attempt) => attempt,
            other => panic!("expected an invocation, got {other:?}"),
        }
    }

    fn succeed(def: &SagaDefinition, instance: &mut SagaInstance, attempt: PlannedAttempt) {
        let effect = step(
            def,
            instance,
            MachineEvent::Finished {
                attempt,
                result: Ok(serde_json::json!({"ok": true})),
            },
        );
        assert_eq!(effect, Effect::Continue);
    }

    fn fail(
        def: &SagaDefinition,
        instance: &mut SagaInstance,
        attempt: PlannedAttempt,
        failure: StepFailure,
    ) {
        step(
            def,
            instance,
            MachineEvent::Finished {
                attempt,
                result: Err(failure),
            },
        );
    }

    #[test]
    fn test_all_steps_succeed() {
        let def = definition();
        let mut instance = new_instance();

        for expected in 0..3 {
            let attempt = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
            assert_eq!(attempt, PlannedAttempt::new(ActionKind::Forward, expected, 1));
            assert_eq!(instance.state(), SagaState::StepRunning(expected));
            succeed(&def, &mut instance, attempt);
        }

        assert_eq!(step(&def, &mut instance, MachineEvent::Resume), Effect::Halt);
        assert_eq!(instance.state(), SagaState::Completed);
        assert_eq!(
            instance.outcome_labels(),
            vec![
                "reserveInventory:success",
                "chargePayment:success",
                "scheduleShipping:success"
            ]
        );
    }

    #[test]
    fn test_permanent_failure_compensates_in_reverse() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, charge, StepFailure::permanent("card declined"));

        // Permanent failures bypass the remaining retry budget.
        assert_eq!(step(&def, &mut instance, MachineEvent::Resume), Effect::Continue);
        assert_eq!(instance.state(), SagaState::CompensatingRunning(1));

        let release = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        assert_eq!(release, PlannedAttempt::new(ActionKind::Compensate, 0, 1));
        succeed(&def, &mut instance, release);

        assert_eq!(step(&def, &mut instance, MachineEvent::Resume), Effect::Halt);
        assert_eq!(instance.state(), SagaState::Compensated);
        assert_eq!(
            instance.outcome_labels(),
            vec![
                "reserveInventory:success",
                "chargePayment:failure",
                "reserveInventory:compensate:success"
            ]
        );
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, charge, StepFailure::transient("timeout from gateway"));

        let effect = step(&def, &mut instance, MachineEvent::Resume);
        assert_eq!(effect, Effect::Sleep(Duration::from_millis(100)));
        assert_eq!(instance.retry_pending(), Some(2));

        let retry = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        assert_eq!(retry, PlannedAttempt::new(ActionKind::Forward, 1, 2));
        assert_eq!(instance.state(), SagaState::StepRunning(1));
    }

    #[test]
    fn test_retry_exhaustion_starts_compensation() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);

        let mut delays = Vec::new();
        loop {
            let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
            fail(&def, &mut instance, charge, StepFailure::transient("unavailable"));
            match step(&def, &mut instance, MachineEvent::Resume) {
                Effect::Sleep(delay) => delays.push(delay),
                Effect::Continue => break,
                other => panic!("unexpected effect {other:?}"),
            }
        }

        assert_eq!(
            delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        let failures = instance
            .outcomes()
            .iter()
            .filter(|o| o.step_index == 1 && o.result == OutcomeResult::Failure)
            .count();
        assert_eq!(failures, 3);
        assert!(instance.state().is_compensating());
        assert!(instance.failure_reason().unwrap().contains("after 3 attempts"));
    }

    #[test]
    fn test_timeout_is_a_retryable_failure() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));

        assert_eq!(
            step(&def, &mut instance, MachineEvent::TimedOut { attempt: charge }),
            Effect::Continue
        );
        assert_eq!(instance.last_outcome().unwrap().result, OutcomeResult::Timeout);
        assert!(matches!(
            step(&def, &mut instance, MachineEvent::Resume),
            Effect::Sleep(_)
        ));
    }

    #[test]
    fn test_second_signal_for_same_attempt_is_stale() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        step(&def, &mut instance, MachineEvent::TimedOut { attempt: reserve });

        let late = decide(
            &def,
            &instance,
            MachineEvent::Finished {
                attempt: reserve,
                result: Ok(serde_json::json!({})),
            },
        );
        assert!(matches!(late, Err(SagaError::StaleSignal { .. })));

        let duplicate = decide(&def, &instance, MachineEvent::TimedOut { attempt: reserve });
        assert!(matches!(duplicate, Err(SagaError::StaleSignal { .. })));
    }

    #[test]
    fn test_duplicate_compensation_signal_is_stale() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, charge, StepFailure::permanent("declined"));
        step(&def, &mut instance, MachineEvent::Resume);

        let release = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, release);

        let duplicate = decide(&def, &instance, MachineEvent::TimedOut { attempt: release });
        assert!(matches!(duplicate, Err(SagaError::StaleSignal { .. })));

        step(&def, &mut instance, MachineEvent::Resume);
        let compensations = instance
            .outcomes()
            .iter()
            .filter(|o| o.kind == ActionKind::Compensate)
            .count();
        assert_eq!(compensations, 1);
    }

    #[test]
    fn test_steps_without_compensation_are_skipped() {
        let def = SagaDefinition::builder("notify")
            .step(
                StepDefinition::new("reserve", ActionDescriptor::named("reserve"))
                    .compensate_with(ActionDescriptor::named("release")),
            )
            .step(StepDefinition::new("email", ActionDescriptor::named("email")))
            .step(StepDefinition::new("charge", ActionDescriptor::named("charge")))
            .build();
        let mut instance = new_instance();

        for _ in 0..2 {
            let attempt = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
            succeed(&def, &mut instance, attempt);
        }
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, charge, StepFailure::permanent("declined"));
        step(&def, &mut instance, MachineEvent::Resume);

        let release = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        assert_eq!(release, PlannedAttempt::new(ActionKind::Compensate, 0, 1));
    }

    #[test]
    fn test_failed_first_step_compensates_nothing() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, reserve, StepFailure::permanent("out of stock"));
        step(&def, &mut instance, MachineEvent::Resume);

        assert_eq!(step(&def, &mut instance, MachineEvent::Resume), Effect::Halt);
        assert_eq!(instance.state(), SagaState::Compensated);
    }

    #[test]
    fn test_compensation_failure_is_terminal() {
        let def = definition();
        let mut instance = new_instance();

        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        succeed(&def, &mut instance, reserve);
        let charge = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, charge, StepFailure::permanent("declined"));
        step(&def, &mut instance, MachineEvent::Resume);

        let release = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));
        fail(&def, &mut instance, release, StepFailure::transient("warehouse offline"));

        // reserveInventory has no retry budget for its compensation.
        assert_eq!(step(&def, &mut instance, MachineEvent::Resume), Effect::Halt);
        assert_eq!(instance.state(), SagaState::CompensationFailed);
        assert!(instance.failure_reason().unwrap().contains("warehouse offline"));
    }

    #[test]
    fn test_in_flight_attempt_is_redriven_without_a_record() {
        let def = definition();
        let mut instance = new_instance();
        let reserve = invoke_expected(step(&def, &mut instance, MachineEvent::Resume));

        let decision = decide(&def, &instance, MachineEvent::Resume).unwrap();
        assert_eq!(decision.record, None);
        assert_eq!(decision.effect, Effect::Invoke(reserve));
    }

    #[test]
    fn test_abandon() {
        let mut instance = new_instance();
        let transition = abandon(&instance, "remediated by hand").unwrap();
        instance.apply(&transition, Utc::now());
        assert_eq!(instance.state(), SagaState::Abandoned);

        assert!(matches!(
            abandon(&instance, "again"),
            Err(SagaError::AlreadyTerminal { state: SagaState::Abandoned, .. })
        ));
        assert_eq!(
            decide(&definition(), &instance, MachineEvent::Resume).unwrap(),
            Decision::halt()
        );
    }
}
