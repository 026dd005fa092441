//! Shared types for the saga orchestration coordinator.

pub mod types;

pub use types::InstanceId;
