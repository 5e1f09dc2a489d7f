//! In-memory task store.
//!
//! Records live only as long as the process. Suitable for single-instance
//! deployments where pollers do not need history across restarts.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{StoreError, TaskId, TaskLookup, TaskRecord, TaskStatus};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// DashMap-backed [`TaskStore`].
///
/// Each update holds the shard lock for one read-modify-write, so writers to
/// the same record are serialized while unrelated ids mostly land on other
/// shards.
pub struct InMemoryTaskStore {
    records: DashMap<TaskId, TaskRecord>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn reset(&self) {
        self.records.clear();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, endpoint: &str) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new(self.ids.generate_task_id(), endpoint, self.clock.now());
        self.records.insert(record.task_id, record.clone());
        Ok(record)
    }

    async fn update(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let mut entry = self
            .records
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        entry.set_status(status, self.clock.now());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskLookup, StoreError> {
        Ok(match self.records.get(&task_id) {
            Some(record) => TaskLookup::Found(record.clone()),
            None => TaskLookup::not_found(task_id, self.clock.now()),
        })
    }
}
