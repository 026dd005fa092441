use async_trait::async_trait;

use crate::{
    InstanceHistory, InstanceId, LogEntry, LogFilter, Result, SagaLogError, SequenceNumber,
};

/// Options for appending an entry to the log.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence of the instance before this append.
    /// If None, only the strictly-increasing check is performed.
    pub expected_sequence: Option<SequenceNumber>,
}

impl AppendOptions {
    /// Creates options with no expectation on the current sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the instance to be at a specific sequence.
    pub fn expect_sequence(sequence: SequenceNumber) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the instance to have no entries yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(SequenceNumber::initial()),
        }
    }
}

/// Durable, append-only storage for saga instance transitions.
///
/// Implementations must be thread-safe. `append` must not return `Ok` until
/// the entry is durable: the coordinator performs the side effect announced
/// by an entry only after its append succeeded, and recovery trusts exactly
/// what is on record.
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Appends one entry to an instance's history.
    ///
    /// Fails with `SequenceConflict` if `options.expected_sequence` is set and
    /// does not match the instance's current last sequence, or if the entry's
    /// sequence does not advance the history.
    ///
    /// Returns the sequence of the appended entry.
    async fn append(&self, entry: LogEntry, options: AppendOptions) -> Result<SequenceNumber>;

    /// Retrieves all entries of one instance in sequence order.
    async fn read_instance(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>>;

    /// Retrieves the histories of all instances matching `filter`.
    ///
    /// Histories are ordered by the timestamp of their first entry.
    async fn read_all(&self, filter: LogFilter) -> Result<Vec<InstanceHistory>>;

    /// Gets the last sequence of an instance, or None if it has no entries.
    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>>;
}

/// Convenience methods available on every saga log.
#[async_trait]
pub trait SagaLogExt: SagaLog {
    /// Checks if an instance has any entries.
    async fn instance_exists(&self, instance_id: InstanceId) -> Result<bool> {
        Ok(self.last_sequence(instance_id).await?.is_some())
    }

    /// Loads one instance's history, or None if it has no entries.
    async fn read_history(&self, instance_id: InstanceId) -> Result<Option<InstanceHistory>> {
        Ok(InstanceHistory::from_entries(
            self.read_instance(instance_id).await?,
        ))
    }
}

impl<T: SagaLog + ?Sized> SagaLogExt for T {}

/// Checks an entry against the instance's current last sequence.
///
/// Shared by all backends so they agree on what a valid append is.
pub fn validate_entry_for_append(
    entry: &LogEntry,
    current: SequenceNumber,
    options: &AppendOptions,
) -> Result<()> {
    if entry.saga_type.trim().is_empty() {
        return Err(SagaLogError::InvalidEntry(
            "saga_type must not be empty".to_string(),
        ));
    }

    if let Some(expected) = options.expected_sequence {
        if current != expected {
            return Err(SagaLogError::SequenceConflict {
                instance_id: entry.instance_id,
                expected,
                actual: current,
            });
        }
        if entry.sequence != expected.next() {
            return Err(SagaLogError::InvalidEntry(format!(
                "Entry sequence must follow the expected sequence. Expected {}, got {}",
                expected.next(),
                entry.sequence
            )));
        }
    }

    if entry.sequence <= current {
        return Err(SagaLogError::SequenceConflict {
            instance_id: entry.instance_id,
            expected: entry.sequence,
            actual: current,
        });
    }

    Ok(())
}
