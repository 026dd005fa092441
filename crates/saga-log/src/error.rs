use thiserror::Error;

use crate::{InstanceId, SequenceNumber};

/// Errors that can occur when interacting with the saga log.
#[derive(Debug, Error)]
pub enum SagaLogError {
    /// Another writer appended to the instance first, or the entry was
    /// sequenced against a stale view of the instance.
    #[error(
        "Sequence conflict for instance {instance_id}: expected sequence {expected}, found {actual}"
    )]
    SequenceConflict {
        instance_id: InstanceId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The entry failed validation and was not written.
    #[error("Invalid log entry: {0}")]
    InvalidEntry(String),

    /// The append could not be confirmed durable.
    #[error("Saga log unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga log operations.
pub type Result<T> = std::result::Result<T, SagaLogError>;
