//! DeadLetterStore port - append-only record of failed compensations.

use async_trait::async_trait;

use crate::domain::{DeadLetterEntry, DeadLetterId, ErrorInfo, StepId, StoreError, TaskId};

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert(
        &self,
        task_id: TaskId,
        step_id: StepId,
        error: &ErrorInfo,
    ) -> Result<DeadLetterEntry, StoreError>;

    /// Oldest first.
    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Bookkeeping for manual replays.
    async fn increment_retry_count(&self, id: DeadLetterId) -> Result<(), StoreError>;

    async fn delete(&self, id: DeadLetterId) -> Result<(), StoreError>;
}
