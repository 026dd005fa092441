use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstanceId, Result, SagaLogError};

/// Unique identifier for a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entry ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry within one instance's history.
///
/// Sequence numbers start at 1 for the first entry of an instance and
/// increase by exactly 1 per appended entry. `initial()` (0) denotes an
/// instance with no entries yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Sequence of an instance that has not been written yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Sequence of an instance's first entry.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One durable state transition of a saga instance.
///
/// `state`, `step_index` and `terminal` duplicate information carried in
/// `payload` so that storage backends can filter without understanding the
/// transition format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,

    /// The instance this entry belongs to.
    pub instance_id: InstanceId,

    /// The saga type name the instance was started with.
    pub saga_type: String,

    /// Position of this entry in the instance's history.
    pub sequence: SequenceNumber,

    /// The kind of transition (e.g. "StepStarted", "SagaCompensated").
    pub entry_type: String,

    /// Lifecycle state label of the instance after this transition.
    pub state: String,

    /// Step the transition refers to, if any.
    pub step_index: Option<usize>,

    /// Whether this transition puts the instance in a terminal state.
    pub terminal: bool,

    pub timestamp: DateTime<Utc>,

    /// The serialized transition.
    pub payload: serde_json::Value,
}

impl LogEntry {
    /// Creates a new log entry builder.
    pub fn builder() -> LogEntryBuilder {
        LogEntryBuilder::default()
    }
}

/// Builder for constructing log entries.
#[derive(Debug, Default)]
pub struct LogEntryBuilder {
    entry_id: Option<EntryId>,
    instance_id: Option<InstanceId>,
    saga_type: Option<String>,
    sequence: Option<SequenceNumber>,
    entry_type: Option<String>,
    state: Option<String>,
    step_index: Option<usize>,
    terminal: bool,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl LogEntryBuilder {
    /// Sets the entry ID. If not set, a new ID will be generated.
    pub fn entry_id(mut self, id: EntryId) -> Self {
        self.entry_id = Some(id);
        self
    }

    pub fn instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn entry_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = Some(entry_type.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn step_index(mut self, step_index: Option<usize>) -> Self {
        self.step_index = step_index;
        self
    }

    pub fn terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the entry, failing if any required field is missing.
    pub fn build(self) -> Result<LogEntry> {
        fn missing(field: &str) -> SagaLogError {
            SagaLogError::InvalidEntry(format!("{field} is required"))
        }

        Ok(LogEntry {
            entry_id: self.entry_id.unwrap_or_default(),
            instance_id: self.instance_id.ok_or_else(|| missing("instance_id"))?,
            saga_type: self.saga_type.ok_or_else(|| missing("saga_type"))?,
            sequence: self.sequence.ok_or_else(|| missing("sequence"))?,
            entry_type: self.entry_type.ok_or_else(|| missing("entry_type"))?,
            state: self.state.ok_or_else(|| missing("state"))?,
            step_index: self.step_index,
            terminal: self.terminal,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or_else(|| missing("payload"))?,
        })
    }
}

/// All entries of one instance, in sequence order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHistory {
    pub instance_id: InstanceId,
    pub saga_type: String,
    pub entries: Vec<LogEntry>,
}

impl InstanceHistory {
    /// Groups entries belonging to one instance into a history.
    ///
    /// Returns `None` for an empty slice.
    pub fn from_entries(mut entries: Vec<LogEntry>) -> Option<Self> {
        entries.sort_by_key(|e| e.sequence);
        let first = entries.first()?;
        Some(Self {
            instance_id: first.instance_id,
            saga_type: first.saga_type.clone(),
            entries,
        })
    }

    /// The most recent entry.
    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// Whether the instance has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.last().is_some_and(|e| e.terminal)
    }
}
