use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    InstanceHistory, InstanceId, LogEntry, LogFilter, Result, SagaLogError, SequenceNumber,
    log::{AppendOptions, SagaLog, validate_entry_for_append},
};

#[derive(Debug, Default)]
struct Entries {
    by_instance: HashMap<InstanceId, Vec<LogEntry>>,
    /// Instances in order of their first entry.
    order: Vec<InstanceId>,
}

/// In-memory saga log for tests and single-process deployments.
///
/// Provides the same interface as the PostgreSQL implementation. Appends are
/// "durable" once the write lock is released. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    entries: Arc<RwLock<Entries>>,
    failing_appends: Arc<AtomicU32>,
}

impl InMemorySagaLog {
    /// Creates a new empty in-memory saga log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail with `SagaLogError::Unavailable`.
    ///
    /// Simulates a storage outage where writes cannot be confirmed durable.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Returns the total number of entries stored.
    pub async fn entry_count(&self) -> usize {
        self.entries
            .read()
            .await
            .by_instance
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        entries.by_instance.clear();
        entries.order.clear();
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn append(&self, entry: LogEntry, options: AppendOptions) -> Result<SequenceNumber> {
        if self.take_injected_failure() {
            return Err(SagaLogError::Unavailable(
                "injected append failure".to_string(),
            ));
        }

        let mut store = self.entries.write().await;

        let current = store
            .by_instance
            .get(&entry.instance_id)
            .and_then(|history| history.last())
            .map(|e| e.sequence)
            .unwrap_or_else(SequenceNumber::initial);

        validate_entry_for_append(&entry, current, &options)?;

        let sequence = entry.sequence;
        let instance_id = entry.instance_id;
        match store.by_instance.get_mut(&instance_id) {
            Some(history) => history.push(entry),
            None => {
                store.by_instance.insert(instance_id, vec![entry]);
                store.order.push(instance_id);
            }
        }

        Ok(sequence)
    }

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>> {
        let store = self.entries.read().await;
        Ok(store
            .by_instance
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn read_all(&self, filter: LogFilter) -> Result<Vec<InstanceHistory>> {
        let store = self.entries.read().await;

        let histories = store
            .order
            .iter()
            .filter_map(|id| store.by_instance.get(id))
            .filter_map(|entries| InstanceHistory::from_entries(entries.clone()))
            .filter(|history| filter.matches(history));

        Ok(match filter.limit {
            Some(limit) => histories.take(limit).collect(),
            None => histories.collect(),
        })
    }

    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>> {
        let store = self.entries.read().await;
        Ok(store
            .by_instance
            .get(&instance_id)
            .and_then(|history| history.last())
            .map(|e| e.sequence))
    }
}
