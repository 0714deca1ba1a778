//! TaskStore port - the `tasks` table.
//!
//! No retry policy lives here: the store only performs the narrow,
//! conditional writes that callers (poller, executor, reaper) decide on.
//!
//! # Ownership fence
//! Executor writes (`update_completed`, `fail`, `schedule_retry`) only apply
//! while the row is `running` and still owned by the given worker. They
//! return `false` when the fence did not match, which happens when the
//! reaper already requeued the task or the task was cancelled meanwhile.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    CancelOutcome, ErrorInfo, NewTask, ReapedTask, RetrySchedule, StoreError, Task, TaskId,
    TaskStatus, WorkerId,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` task.
    async fn create(&self, new_task: NewTask) -> Result<Task, StoreError>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Unconditional status write (rollback bookkeeping).
    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError>;

    /// `heartbeat_at = now`, only while the task is running under `owner`.
    async fn update_heartbeat(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError>;

    /// running -> completed with `output`.
    async fn update_completed(
        &self,
        id: TaskId,
        owner: &WorkerId,
        output: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// running -> failed with `error`.
    async fn fail(&self, id: TaskId, owner: &WorkerId, error: &ErrorInfo)
    -> Result<bool, StoreError>;

    /// running -> pending, `scheduled_at = now + delay`, `retry_count += 1`,
    /// ownership and heartbeat cleared.
    async fn schedule_retry(
        &self,
        id: TaskId,
        owner: &WorkerId,
        retry: &RetrySchedule,
    ) -> Result<bool, StoreError>;

    /// running -> pending without touching `retry_count`, for a claim this
    /// worker could not start. Ownership and heartbeat cleared.
    async fn release(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError>;

    /// Atomically claim up to `batch_size` eligible tasks for `worker_id`.
    ///
    /// Eligible: `pending` and `scheduled_at` null or due. Order:
    /// `priority DESC, created_at ASC`. Claimed rows come back `running`
    /// with `worker_id` set and a fresh heartbeat. Concurrent callers never
    /// receive the same row.
    async fn dequeue(&self, batch_size: usize, worker_id: &WorkerId)
    -> Result<Vec<Task>, StoreError>;

    /// pending | running -> cancelled; anything else is rejected.
    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, StoreError>;

    /// Reaper (a): stale running tasks with budget left go back to pending,
    /// due immediately, with ownership and heartbeat cleared.
    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<ReapedTask>, StoreError>;

    /// Reaper (b): stale running tasks without budget are failed with `error`.
    async fn fail_exhausted(
        &self,
        stale_after: Duration,
        error: &ErrorInfo,
    ) -> Result<Vec<ReapedTask>, StoreError>;
}
