//! TaskStore port - タスク記録の正本（source of truth）
//!
//! TaskStore は以下を保証します：
//! - create はレコードを永続化してから返す
//! - 同一レコードへの update は直列化される（lost update なし）
//! - 外部の読み手から見て書き込みは all-or-nothing
//! - 未知の task_id に対する get はエラーではなく NotFound

use async_trait::async_trait;

use crate::domain::{StoreError, TaskId, TaskLookup, TaskRecord, TaskStatus};

/// Persistence for [`TaskRecord`]s.
///
/// Records are append/update-only; nothing is ever deleted.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocate an id, persist a `created` record for `endpoint`, and return it.
    async fn create(&self, endpoint: &str) -> Result<TaskRecord, StoreError>;

    /// Replace the status of an existing record and bump its timestamp.
    ///
    /// Returns `StoreError::NotFound` for an id that was never created.
    async fn update(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError>;

    /// Look a record up without mutating it.
    ///
    /// Only an unreadable backing medium is an error; an unknown id is
    /// `Ok(TaskLookup::NotFound(..))`.
    async fn get(&self, task_id: TaskId) -> Result<TaskLookup, StoreError>;

    async fn complete(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        self.update(task_id, status).await
    }

    async fn fail(&self, task_id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        self.update(task_id, status).await
    }
}
