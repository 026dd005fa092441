//! Saga orchestration.
//!
//! A saga is an ordered list of steps, each with a forward action and an
//! optional compensating action. The [`SagaCoordinator`] runs the forward
//! actions in order; when one fails for good it runs the compensating
//! actions of the completed steps in reverse order.
//!
//! Every transition is written to a [`saga_log::SagaLog`] before the action
//! it announces is performed, so a crashed coordinator can rebuild each
//! instance from the log and continue where it stopped.
//!
//! The pieces:
//! - [`DefinitionRegistry`]: saga definitions, built once at startup
//! - [`machine`]: pure decisions from instance state and events
//! - [`RetryPolicy`]: exponential backoff per step
//! - [`TimeoutScheduler`]: step deadlines
//! - [`StepInvoker`]: the collaborator that actually performs actions

pub mod coordinator;
pub mod definition;
pub mod error;
pub mod instance;
pub mod invoker;
pub mod machine;
pub mod order_fulfillment;
pub mod registry;
pub mod retry;
pub mod state;
pub mod timeout;
pub mod transition;

pub use coordinator::{CoordinatorConfig, SagaCoordinator, StartReceipt};
pub use definition::{ActionDescriptor, SagaDefinition, StepDefinition};
pub use error::{Result, SagaError};
pub use instance::{OutcomeResult, PlannedAttempt, SagaInstance, StepOutcome};
pub use invoker::{InMemoryStepInvoker, Invocation, StepFailure, StepInvoker};
pub use machine::{Decision, Effect, MachineEvent};
pub use registry::DefinitionRegistry;
pub use retry::{RetryDecision, RetryPolicy};
pub use state::SagaState;
pub use timeout::{TimeoutHandle, TimeoutScheduler};
pub use transition::{ActionKind, SagaTransition};
