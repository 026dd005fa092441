use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Invocation, StepFailure, StepInvoker};
use crate::transition::ActionKind;

#[derive(Debug, Clone, Default)]
enum Behavior {
    #[default]
    Succeed,
    FailPermanently(String),
    FailTransiently {
        remaining: u32,
    },
    AlwaysFailTransiently,
    Hang,
}

#[derive(Debug, Clone, Default)]
struct Script {
    behavior: Behavior,
    latency: Option<Duration>,
    payload: Option<serde_json::Value>,
}

enum Planned {
    Succeed(serde_json::Value),
    Fail(StepFailure),
    Hang,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<(String, ActionKind), Script>,
    default_latency: Option<Duration>,
    calls: Vec<Invocation>,
    /// Successful effects by attempt key.
    applied: HashMap<String, serde_json::Value>,
}

/// Scripted step invoker for tests and the demo server.
///
/// Unscripted actions succeed with a small JSON payload. Behavior is
/// scripted per step name and direction. Every invocation is recorded, and
/// an attempt key that already succeeded returns its first result again
/// without applying a second effect. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepInvoker {
    state: Arc<Mutex<State>>,
}

impl InMemoryStepInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every action answers after `latency` unless scripted otherwise.
    pub fn with_latency(latency: Duration) -> Self {
        let invoker = Self::new();
        invoker.lock().default_latency = Some(latency);
        invoker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn script(&self, step: &str, kind: ActionKind, edit: impl FnOnce(&mut Script)) -> &Self {
        let mut state = self.lock();
        edit(state.scripts.entry((step.to_string(), kind)).or_default());
        self
    }

    /// The forward action of `step` is rejected with a non-retryable failure.
    pub fn fail_permanently(&self, step: &str, detail: impl Into<String>) -> &Self {
        let detail = detail.into();
        self.script(step, ActionKind::Forward, |s| {
            s.behavior = Behavior::FailPermanently(detail)
        })
    }

    /// The forward action of `step` fails transiently `times` times, then succeeds.
    pub fn fail_transiently(&self, step: &str, times: u32) -> &Self {
        self.script(step, ActionKind::Forward, |s| {
            s.behavior = Behavior::FailTransiently { remaining: times }
        })
    }

    pub fn always_fail_transiently(&self, step: &str) -> &Self {
        self.script(step, ActionKind::Forward, |s| {
            s.behavior = Behavior::AlwaysFailTransiently
        })
    }

    /// The forward action of `step` never answers.
    pub fn hang(&self, step: &str) -> &Self {
        self.script(step, ActionKind::Forward, |s| s.behavior = Behavior::Hang)
    }

    /// The forward action of `step` answers only after `delay`.
    pub fn respond_after(&self, step: &str, delay: Duration) -> &Self {
        self.script(step, ActionKind::Forward, |s| s.latency = Some(delay))
    }

    /// Payload returned by a successful forward action of `step`.
    pub fn with_payload(&self, step: &str, payload: serde_json::Value) -> &Self {
        self.script(step, ActionKind::Forward, |s| s.payload = Some(payload))
    }

    pub fn fail_compensation_permanently(&self, step: &str, detail: impl Into<String>) -> &Self {
        let detail = detail.into();
        self.script(step, ActionKind::Compensate, |s| {
            s.behavior = Behavior::FailPermanently(detail)
        })
    }

    pub fn fail_compensation_transiently(&self, step: &str, times: u32) -> &Self {
        self.script(step, ActionKind::Compensate, |s| {
            s.behavior = Behavior::FailTransiently { remaining: times }
        })
    }

    pub fn always_fail_compensation(&self, step: &str) -> &Self {
        self.script(step, ActionKind::Compensate, |s| {
            s.behavior = Behavior::AlwaysFailTransiently
        })
    }

    pub fn hang_compensation(&self, step: &str) -> &Self {
        self.script(step, ActionKind::Compensate, |s| s.behavior = Behavior::Hang)
    }

    /// Every invocation received, in arrival order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.lock().calls.clone()
    }

    /// Number of invocations of one action, including repeats.
    pub fn call_count(&self, step: &str, kind: ActionKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.step_name == step && c.kind == kind)
            .count()
    }

    /// Whether the forward action of `step` was ever invoked.
    pub fn invoked(&self, step: &str) -> bool {
        self.call_count(step, ActionKind::Forward) > 0
    }

    /// Number of distinct successful effects of one action.
    pub fn effect_count(&self, step: &str, kind: ActionKind) -> usize {
        let state = self.lock();
        state
            .calls
            .iter()
            .filter(|c| c.step_name == step && c.kind == kind)
            .map(Invocation::attempt_key)
            .filter(|key| state.applied.contains_key(key))
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    /// Step names of invocations of one direction, in arrival order.
    pub fn call_sequence(&self, kind: ActionKind) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.step_name.clone())
            .collect()
    }

    fn plan(&self, invocation: &Invocation) -> (Option<Duration>, Planned) {
        let mut state = self.lock();
        state.calls.push(invocation.clone());

        if let Some(payload) = state.applied.get(&invocation.attempt_key()) {
            return (None, Planned::Succeed(payload.clone()));
        }

        let default_latency = state.default_latency;
        let key = (invocation.step_name.clone(), invocation.kind);
        let script = state.scripts.entry(key).or_default();
        let latency = script.latency.or(default_latency);

        let planned = match &mut script.behavior {
            Behavior::Succeed => Planned::Succeed(script.payload.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "step": invocation.step_name,
                    "kind": invocation.kind.as_str(),
                    "attempt": invocation.attempt,
                })
            })),
            Behavior::FailPermanently(detail) => Planned::Fail(StepFailure::permanent(detail.clone())),
            Behavior::FailTransiently { remaining } if *remaining > 0 => {
                *remaining -= 1;
                Planned::Fail(StepFailure::transient(format!(
                    "{} unavailable",
                    invocation.step_name
                )))
            }
            Behavior::FailTransiently { .. } => Planned::Succeed(
                script
                    .payload
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "step": invocation.step_name })),
            ),
            Behavior::AlwaysFailTransiently => Planned::Fail(StepFailure::transient(format!(
                "{} unavailable",
                invocation.step_name
            ))),
            Behavior::Hang => Planned::Hang,
        };

        (latency, planned)
    }
}

#[async_trait]
impl StepInvoker for InMemoryStepInvoker {
    async fn invoke(&self, invocation: Invocation) -> Result<serde_json::Value, StepFailure> {
        let (latency, planned) = self.plan(&invocation);

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        match planned {
            Planned::Succeed(payload) => {
                self.lock()
                    .applied
                    .entry(invocation.attempt_key())
                    .or_insert_with(|| payload.clone());
                Ok(payload)
            }
            Planned::Fail(failure) => Err(failure),
            Planned::Hang => std::future::pending().await,
        }
    }
}
