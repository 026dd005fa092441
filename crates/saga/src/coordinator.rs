//! Saga coordinator: starts, drives, recovers and abandons saga instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::InstanceId;
use saga_log::{AppendOptions, LogEntry, LogFilter, SagaLog, SagaLogError, SequenceNumber};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::instance::{PlannedAttempt, SagaInstance};
use crate::invoker::{Invocation, StepInvoker};
use crate::machine::{self, Effect, MachineEvent};
use crate::registry::DefinitionRegistry;
use crate::state::SagaState;
use crate::timeout::TimeoutScheduler;
use crate::transition::{ActionKind, SagaTransition};

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Tries per log append before the instance is halted.
    pub log_append_attempts: u32,
    /// Pause between append tries.
    pub log_retry_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_append_attempts: 3,
            log_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Returned by [`SagaCoordinator::start`] before any step has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReceipt {
    pub instance_id: InstanceId,
    pub state: SagaState,
}

enum Control {
    Abandon {
        reason: String,
        reply: oneshot::Sender<Result<SagaInstance>>,
    },
}

struct WorkerHandle {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<SagaState>,
    task: JoinHandle<()>,
}

struct Inner<L, I> {
    registry: Arc<DefinitionRegistry>,
    log: L,
    invoker: I,
    scheduler: TimeoutScheduler,
    config: CoordinatorConfig,
    workers: Mutex<HashMap<InstanceId, WorkerHandle>>,
}

/// Drives saga instances to a terminal state.
///
/// Every active instance is owned by exactly one tokio task, so all
/// execution for an instance is serialized without locking. Each transition
/// is appended to the saga log before the effect it announces is performed,
/// and the in-memory instance is only advanced after the append succeeded.
/// After a crash, [`SagaCoordinator::recover`] rebuilds instances from the
/// log and resumes them.
///
/// Clones share the same workers.
pub struct SagaCoordinator<L, I> {
    inner: Arc<Inner<L, I>>,
}

impl<L, I> Clone for SagaCoordinator<L, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L, I> SagaCoordinator<L, I>
where
    L: SagaLog + 'static,
    I: StepInvoker + 'static,
{
    /// Creates a coordinator. Must be called within a tokio runtime.
    pub fn new(registry: Arc<DefinitionRegistry>, log: L, invoker: I) -> Self {
        Self::with_config(registry, log, invoker, CoordinatorConfig::default())
    }

    pub fn with_config(
        registry: Arc<DefinitionRegistry>,
        log: L,
        invoker: I,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                log,
                invoker,
                scheduler: TimeoutScheduler::spawn(),
                config,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.inner.registry
    }

    pub fn log(&self) -> &L {
        &self.inner.log
    }

    /// Creates and persists a new instance and begins executing it.
    ///
    /// Returns as soon as the instance is on record; use [`Self::status`],
    /// [`Self::subscribe`] or [`Self::wait_for_terminal`] to follow it.
    #[tracing::instrument(skip(self, input))]
    pub async fn start(&self, saga_type: &str, input: serde_json::Value) -> Result<StartReceipt> {
        let definition = self.inner.registry.lookup(saga_type)?;

        let instance_id = InstanceId::new();
        let now = Utc::now();
        let transition = SagaTransition::saga_started(saga_type, input);
        let instance = SagaInstance::from_started(instance_id, &transition, now)?;
        let entry = log_entry(&instance, &transition, now)?;

        self.inner
            .append_durably(entry, SequenceNumber::initial())
            .await?;

        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        tracing::info!(%instance_id, saga_type, "saga started");

        let state = instance.state();
        self.spawn_worker(definition, instance);

        Ok(StartReceipt { instance_id, state })
    }

    /// Current snapshot of an instance, rebuilt from the log.
    #[tracing::instrument(skip(self))]
    pub async fn status(&self, instance_id: InstanceId) -> Result<SagaInstance> {
        let entries = self.history(instance_id).await?;
        SagaInstance::replay(&entries)
    }

    /// Raw log entries of an instance in sequence order.
    pub async fn history(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>> {
        let entries = self.inner.log.read_instance(instance_id).await?;
        if entries.is_empty() {
            return Err(SagaError::InstanceNotFound(instance_id));
        }
        Ok(entries)
    }

    /// Resumes every non-terminal instance found in the log.
    ///
    /// Instances that already have a live worker are left alone. Instances
    /// whose saga type is not registered, or whose history cannot be
    /// replayed, are reported and skipped. Returns the resumed ids.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<InstanceId>> {
        let histories = self.inner.log.read_all(LogFilter::non_terminal()).await?;
        let mut resumed = Vec::new();

        for history in histories {
            let instance_id = history.instance_id;
            if self.inner.is_owned(instance_id) {
                tracing::debug!(%instance_id, "instance already running; not recovering");
                continue;
            }

            let definition = match self.inner.registry.lookup(&history.saga_type) {
                Ok(definition) => definition,
                Err(error) => {
                    tracing::error!(%instance_id, %error, "cannot recover saga instance");
                    continue;
                }
            };

            let instance = match SagaInstance::replay(&history.entries) {
                Ok(instance) => instance,
                Err(error) => {
                    tracing::error!(%instance_id, %error, "cannot replay saga instance");
                    continue;
                }
            };
            if instance.is_terminal() {
                continue;
            }

            tracing::info!(
                %instance_id,
                saga_type = %history.saga_type,
                state = %instance.state(),
                "resuming saga instance"
            );
            if self.spawn_worker(definition, instance) {
                metrics::counter!("saga_recovered_total").increment(1);
                resumed.push(instance_id);
            }
        }

        tracing::info!(recovered = resumed.len(), "recovery finished");
        Ok(resumed)
    }

    /// Stops an instance without running any further compensation.
    ///
    /// Meant for instances an operator has remediated by hand.
    #[tracing::instrument(skip(self, reason))]
    pub async fn abandon(
        &self,
        instance_id: InstanceId,
        reason: impl Into<String>,
    ) -> Result<SagaInstance> {
        let reason = reason.into();

        let control = self
            .inner
            .lock_workers()
            .get(&instance_id)
            .map(|worker| worker.control.clone());

        if let Some(control) = control {
            let (reply, answer) = oneshot::channel();
            let request = Control::Abandon {
                reason: reason.clone(),
                reply,
            };
            if control.send(request).is_ok() {
                if let Ok(result) = answer.await {
                    return result;
                }
            }
            // The worker finished before handling the request; the log
            // decides below.
        }

        let instance = self.status(instance_id).await?;
        let transition = machine::abandon(&instance, reason)?;
        self.inner.record(&instance, &transition).await
    }

    /// Watches the lifecycle state of an instance.
    ///
    /// For an instance without a live worker the receiver holds the state on
    /// record and never changes.
    pub async fn subscribe(&self, instance_id: InstanceId) -> Result<watch::Receiver<SagaState>> {
        let live = self
            .inner
            .lock_workers()
            .get(&instance_id)
            .map(|worker| worker.state.clone());
        if let Some(receiver) = live {
            return Ok(receiver);
        }

        let instance = self.status(instance_id).await?;
        let (_sender, receiver) = watch::channel(instance.state());
        Ok(receiver)
    }

    /// Waits until the instance is terminal, its worker stops, or `within`
    /// elapses, then returns the snapshot on record.
    pub async fn wait_for_terminal(
        &self,
        instance_id: InstanceId,
        within: Duration,
    ) -> Result<SagaInstance> {
        let mut receiver = self.subscribe(instance_id).await?;
        let settled = async {
            loop {
                if receiver.borrow_and_update().is_terminal() {
                    break;
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(within, settled).await.is_err() {
            tracing::debug!(%instance_id, "instance still running after wait");
        }
        self.status(instance_id).await
    }

    /// Ids of instances with a live worker.
    pub fn active_instances(&self) -> Vec<InstanceId> {
        self.inner
            .lock_workers()
            .iter()
            .filter(|(_, worker)| !worker.task.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Stops all workers without recording anything.
    ///
    /// The log is left exactly as a crash would leave it; a later
    /// [`Self::recover`] picks the instances up again.
    pub async fn shutdown(&self) {
        let workers: Vec<(InstanceId, WorkerHandle)> =
            self.inner.lock_workers().drain().collect();

        for (_, worker) in &workers {
            worker.task.abort();
        }
        for (_, worker) in workers {
            let _ = worker.task.await;
        }
        tracing::info!("saga coordinator stopped");
    }

    /// Spawns the owning task for `instance` unless one is already running.
    fn spawn_worker(&self, definition: Arc<SagaDefinition>, instance: SagaInstance) -> bool {
        let instance_id = instance.id();
        let mut workers = self.inner.lock_workers();
        if workers
            .get(&instance_id)
            .is_some_and(|worker| !worker.task.is_finished())
        {
            return false;
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(instance.state());
        let worker = Worker {
            inner: Arc::clone(&self.inner),
            definition,
            instance,
            control: control_rx,
            state: state_tx,
        };

        // Spawned while holding the lock so the worker cannot release its
        // slot before it is registered.
        let task = tokio::spawn(worker.run());
        workers.insert(
            instance_id,
            WorkerHandle {
                control: control_tx,
                state: state_rx,
                task,
            },
        );
        true
    }
}

impl<L, I> Inner<L, I>
where
    L: SagaLog,
    I: StepInvoker,
{
    fn lock_workers(&self) -> MutexGuard<'_, HashMap<InstanceId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_owned(&self, instance_id: InstanceId) -> bool {
        self.lock_workers()
            .get(&instance_id)
            .is_some_and(|worker| !worker.task.is_finished())
    }

    fn release(&self, instance_id: InstanceId) {
        self.lock_workers().remove(&instance_id);
    }

    /// Appends `transition` on top of `instance` and returns the advanced
    /// instance. `instance` itself stays untouched if the append fails.
    async fn record(
        &self,
        instance: &SagaInstance,
        transition: &SagaTransition,
    ) -> Result<SagaInstance> {
        let now = Utc::now();
        let mut next = instance.clone();
        next.apply(transition, now);

        let entry = log_entry(&next, transition, now)?;
        self.append_durably(entry, instance.sequence()).await?;
        observe(&next, transition);
        Ok(next)
    }

    /// Appends with bounded retries.
    ///
    /// A sequence conflict means another writer owns the instance and is
    /// never retried, unless a previous try of this very entry turns out to
    /// have landed.
    async fn append_durably(&self, entry: LogEntry, expected: SequenceNumber) -> Result<()> {
        let instance_id = entry.instance_id;
        let attempts = self.config.log_append_attempts.max(1);

        for attempt in 1..=attempts {
            let options = AppendOptions::expect_sequence(expected);
            match self.log.append(entry.clone(), options).await {
                Ok(_) => return Ok(()),
                Err(error @ SagaLogError::SequenceConflict { .. }) => {
                    if attempt > 1 && self.already_recorded(&entry).await {
                        return Ok(());
                    }
                    return Err(error.into());
                }
                Err(error) => {
                    metrics::counter!("saga_log_append_failures_total").increment(1);
                    tracing::warn!(
                        %instance_id,
                        sequence = %entry.sequence,
                        attempt,
                        %error,
                        "saga log append failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.log_retry_delay).await;
                    }
                }
            }
        }

        Err(SagaError::LogUnavailable {
            instance_id,
            attempts,
        })
    }

    async fn already_recorded(&self, entry: &LogEntry) -> bool {
        match self.log.read_instance(entry.instance_id).await {
            Ok(entries) => entries.iter().any(|e| e.entry_id == entry.entry_id),
            Err(_) => false,
        }
    }
}

/// Owns one instance from start (or recovery) until it halts.
struct Worker<L, I> {
    inner: Arc<Inner<L, I>>,
    definition: Arc<SagaDefinition>,
    instance: SagaInstance,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<SagaState>,
}

/// How an invocation or backoff ended.
enum Interrupt {
    Event(MachineEvent),
    Control(Control),
}

impl<L, I> Worker<L, I>
where
    L: SagaLog + 'static,
    I: StepInvoker + 'static,
{
    #[tracing::instrument(
        name = "saga_worker",
        skip(self),
        fields(instance_id = %self.instance.id(), saga_type = %self.definition.name())
    )]
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) => tracing::debug!(state = %self.instance.state(), "saga worker finished"),
            Err(error @ SagaError::LogUnavailable { .. }) => tracing::error!(
                %error,
                state = %self.instance.state(),
                "halting saga instance at its last durable state"
            ),
            Err(error) => tracing::error!(
                %error,
                state = %self.instance.state(),
                "saga worker stopped"
            ),
        }

        // Requests that raced with the end of execution.
        self.control.close();
        while let Ok(Control::Abandon { reason, reply }) = self.control.try_recv() {
            let result = self.abandon(reason).await;
            let _ = reply.send(result);
        }
        self.inner.release(self.instance.id());
    }

    async fn drive(&mut self) -> Result<()> {
        let mut event = MachineEvent::Resume;

        loop {
            let decision = match machine::decide(&self.definition, &self.instance, event) {
                Ok(decision) => decision,
                Err(SagaError::StaleSignal { detail, .. }) => {
                    tracing::debug!(%detail, "discarding stale signal");
                    event = MachineEvent::Resume;
                    continue;
                }
                Err(error) => return Err(error),
            };

            if let Some(transition) = &decision.record {
                self.commit(transition).await?;
            }

            let interrupt = match decision.effect {
                Effect::Halt => return Ok(()),
                Effect::Continue => Interrupt::Event(MachineEvent::Resume),
                Effect::Sleep(delay) => self.backoff(delay).await,
                Effect::Invoke(attempt) => self.invoke(attempt).await?,
            };

            event = match interrupt {
                Interrupt::Event(event) => event,
                Interrupt::Control(Control::Abandon { reason, reply }) => {
                    // The interrupted attempt stays in flight on record if
                    // the abandon cannot be appended; recovery re-drives it.
                    let result = self.abandon(reason).await;
                    if let Err(error) = &result {
                        tracing::error!(%error, "abandon could not be recorded");
                    }
                    let _ = reply.send(result);
                    return Ok(());
                }
            };
        }
    }

    async fn commit(&mut self, transition: &SagaTransition) -> Result<()> {
        self.instance = self.inner.record(&self.instance, transition).await?;
        self.state.send_replace(self.instance.state());
        Ok(())
    }

    async fn abandon(&mut self, reason: String) -> Result<SagaInstance> {
        let transition = machine::abandon(&self.instance, reason)?;
        self.commit(&transition).await?;
        Ok(self.instance.clone())
    }

    async fn backoff(&mut self, delay: Duration) -> Interrupt {
        tokio::select! {
            Some(control) = self.control.recv() => Interrupt::Control(control),
            _ = tokio::time::sleep(delay) => Interrupt::Event(MachineEvent::Resume),
        }
    }

    /// Races the invocation against its deadline and operator requests.
    async fn invoke(&mut self, attempt: PlannedAttempt) -> Result<Interrupt> {
        let definition = Arc::clone(&self.definition);
        let step = definition.require_step(attempt.step_index)?;
        let action = match attempt.kind {
            ActionKind::Forward => step.forward.clone(),
            ActionKind::Compensate => step.compensation.clone().ok_or_else(|| {
                SagaError::CorruptHistory(format!(
                    "step {} has no compensating action",
                    step.name
                ))
            })?,
        };

        let instance_id = self.instance.id();
        let invocation = Invocation {
            instance_id,
            saga_type: self.instance.saga_type().to_string(),
            step_index: attempt.step_index,
            step_name: step.name.clone(),
            attempt: attempt.attempt,
            kind: attempt.kind,
            action,
            input: self.instance.input().clone(),
            prior_results: self.instance.prior_results(definition.len()),
        };

        metrics::counter!(
            "saga_step_attempts_total",
            "step" => step.name.clone(),
            "kind" => attempt.kind.as_str()
        )
        .increment(1);
        tracing::debug!(step = %step.name, %attempt, "invoking step");

        let inner = Arc::clone(&self.inner);
        let deadline = deadline_after(tokio::time::Instant::now(), step.timeout);
        let timeout = inner
            .scheduler
            .arm(instance_id, attempt.step_index, deadline);

        let interrupt = tokio::select! {
            biased;
            Some(control) = self.control.recv() => Interrupt::Control(control),
            result = inner.invoker.invoke(invocation) => {
                Interrupt::Event(MachineEvent::Finished { attempt, result })
            }
            _ = timeout.expired() => {
                metrics::counter!("saga_step_timeouts_total", "step" => step.name.clone())
                    .increment(1);
                tracing::warn!(step = %step.name, %attempt, timeout = ?step.timeout, "step timed out");
                Interrupt::Event(MachineEvent::TimedOut { attempt })
            }
        };

        inner.scheduler.disarm(instance_id, attempt.step_index);
        Ok(interrupt)
    }
}

/// About thirty years; what tokio itself treats as "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating at [`FAR_FUTURE`] instead of overflowing.
fn deadline_after(now: tokio::time::Instant, timeout: Duration) -> tokio::time::Instant {
    now.checked_add(timeout)
        .filter(|deadline| deadline.duration_since(now) <= FAR_FUTURE)
        .unwrap_or(now + FAR_FUTURE)
}

fn log_entry(
    after: &SagaInstance,
    transition: &SagaTransition,
    at: chrono::DateTime<Utc>,
) -> Result<LogEntry> {
    Ok(LogEntry::builder()
        .instance_id(after.id())
        .saga_type(after.saga_type())
        .sequence(after.sequence())
        .entry_type(transition.entry_type())
        .state(after.state().to_string())
        .step_index(transition.step_index())
        .terminal(transition.is_terminal())
        .timestamp(at)
        .payload(transition)?
        .build()?)
}

/// Logs and counts a transition that is now on record.
fn observe(instance: &SagaInstance, transition: &SagaTransition) {
    let instance_id = instance.id();
    let saga_type = instance.saga_type().to_string();
    let elapsed = || {
        (Utc::now() - instance.created_at())
            .to_std()
            .unwrap_or_default()
            .as_secs_f64()
    };

    match transition {
        SagaTransition::StepFailed {
            kind,
            step_name,
            attempt,
            error,
            retryable,
            ..
        } => {
            tracing::warn!(%instance_id, %kind, step = %step_name, attempt, retryable, %error, "step failed");
        }
        SagaTransition::RetryScheduled {
            kind,
            step_index,
            next_attempt,
            delay_ms,
        } => {
            metrics::counter!("saga_step_retries_total", "kind" => kind.as_str()).increment(1);
            tracing::warn!(%instance_id, %kind, step_index, next_attempt, delay_ms, "retry scheduled");
        }
        SagaTransition::CompensationStarted {
            failed_step,
            reason,
        } => {
            tracing::warn!(%instance_id, failed_step, %reason, "compensation started");
        }
        SagaTransition::SagaCompleted => {
            metrics::counter!("saga_completed_total", "saga_type" => saga_type).increment(1);
            metrics::histogram!("saga_duration_seconds", "outcome" => "completed")
                .record(elapsed());
            tracing::info!(%instance_id, "saga completed");
        }
        SagaTransition::SagaCompensated => {
            metrics::counter!("saga_compensated_total", "saga_type" => saga_type).increment(1);
            metrics::histogram!("saga_duration_seconds", "outcome" => "compensated")
                .record(elapsed());
            tracing::info!(%instance_id, reason = ?instance.failure_reason(), "saga compensated");
        }
        SagaTransition::CompensationFailed { step_index, reason } => {
            metrics::counter!("saga_compensation_failed_total", "saga_type" => saga_type)
                .increment(1);
            metrics::histogram!("saga_duration_seconds", "outcome" => "compensation_failed")
                .record(elapsed());
            tracing::error!(
                %instance_id,
                step_index,
                %reason,
                "compensation failed; manual intervention required"
            );
        }
        SagaTransition::SagaAbandoned { reason } => {
            metrics::counter!("saga_abandoned_total", "saga_type" => saga_type).increment(1);
            tracing::warn!(%instance_id, %reason, "saga abandoned by operator");
        }
        SagaTransition::SagaStarted { .. }
        | SagaTransition::StepStarted { .. }
        | SagaTransition::StepSucceeded { .. }
        | SagaTransition::StepTimedOut { .. } => {}
    }
}
