//! Durable, append-only record of saga instance state transitions.
//!
//! Every transition of a saga instance is written here before the side
//! effect it announces is performed. The log is the single source of truth
//! for crash recovery: instances are rebuilt by folding their entries in
//! sequence order.

pub mod entry;
pub mod error;
pub mod filter;
pub mod log;
pub mod memory;
pub mod postgres;

pub use common::InstanceId;
pub use entry::{EntryId, InstanceHistory, LogEntry, LogEntryBuilder, SequenceNumber};
pub use error::{Result, SagaLogError};
pub use filter::LogFilter;
pub use log::{AppendOptions, SagaLog, SagaLogExt};
pub use memory::InMemorySagaLog;
pub use postgres::PostgresSagaLog;
