//! Saga error types.

use common::InstanceId;
use saga_log::SagaLogError;
use thiserror::Error;

use crate::state::SagaState;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered under this saga type name.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A definition with this name is already registered.
    #[error("Saga definition already registered: {0}")]
    DuplicateDefinition(String),

    /// The definition is structurally unusable.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// No instance with this id exists in the saga log.
    #[error("Saga instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The instance already reached a terminal state.
    #[error("Saga instance {instance_id} is already terminal ({state})")]
    AlreadyTerminal {
        instance_id: InstanceId,
        state: SagaState,
    },

    /// A completion or timeout arrived for an attempt that is no longer in flight.
    #[error("Stale signal for instance {instance_id}: {detail}")]
    StaleSignal {
        instance_id: InstanceId,
        detail: String,
    },

    /// The logged history cannot be folded into an instance.
    #[error("Corrupt saga history: {0}")]
    CorruptHistory(String),

    /// Appends kept failing; the instance was halted at its last durable state.
    #[error("Saga log unavailable for instance {instance_id} after {attempts} append attempts")]
    LogUnavailable {
        instance_id: InstanceId,
        attempts: u32,
    },

    /// Saga log error.
    #[error("Saga log error: {0}")]
    Log(#[from] SagaLogError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
