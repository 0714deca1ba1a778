//! StepStore port - the `steps` table (memoized step results).

use async_trait::async_trait;

use crate::domain::{ErrorInfo, Step, StepId, StoreError, TaskId};

#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert-if-absent on `(task_id, step_key)`.
    ///
    /// When another caller won the insert, the existing row is returned;
    /// a uniqueness conflict is never surfaced as an error.
    async fn create_or_find(
        &self,
        task_id: TaskId,
        step_key: &str,
        input: Option<serde_json::Value>,
    ) -> Result<Step, StoreError>;

    async fn find_by_task_and_key(
        &self,
        task_id: TaskId,
        step_key: &str,
    ) -> Result<Option<Step>, StoreError>;

    /// All steps of a task, oldest first.
    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Step>, StoreError>;

    async fn update_completed(
        &self,
        id: StepId,
        output: serde_json::Value,
        compensation_fn: Option<String>,
    ) -> Result<(), StoreError>;

    async fn update_failed(&self, id: StepId, error: &ErrorInfo) -> Result<(), StoreError>;

    /// `attempt += 1`, status back to pending.
    async fn increment_attempt(&self, id: StepId) -> Result<(), StoreError>;

    /// Completed steps with a compensation reference that were not undone
    /// yet, most recently completed first.
    async fn find_completed_with_compensation(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Step>, StoreError>;

    async fn mark_compensated(&self, id: StepId) -> Result<(), StoreError>;
}
