//! InMemoryStore - 開発用・テスト用の正本
//!
//! Implements `TaskStore`, `StepStore` and `DeadLetterStore` over a single
//! `tokio::sync::Mutex`. Every operation takes the lock once, so each one is
//! atomic in the same sense the Postgres statements are: a claim selects and
//! flips its rows before any other caller can look at them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    CancelOutcome, DeadLetterEntry, DeadLetterId, ErrorInfo, NewTask, ReapAction, ReapedTask,
    RetrySchedule, Step, StepId, StepStatus, StoreError, Task, TaskId, TaskStatus, WorkerId,
};
use crate::ports::{
    Clock, DeadLetterStore, IdGenerator, StepStore, SystemClock, TaskStore, UlidGenerator,
};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    /// Insertion order; breaks `created_at` ties the way a sequence would.
    task_order: Vec<TaskId>,

    steps: HashMap<StepId, Step>,
    step_order: Vec<StepId>,
    step_keys: HashMap<(TaskId, String), StepId>,

    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
    dead_letter_order: Vec<DeadLetterId>,
}

impl State {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn step_mut(&mut self, id: StepId) -> Result<&mut Step, StoreError> {
        self.steps
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// The task if it is running and owned by `owner`.
    fn owned_running(&mut self, id: TaskId, owner: &WorkerId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).filter(|task| {
            task.status == TaskStatus::Running && task.worker_id.as_ref() == Some(owner)
        })
    }

    fn stale_ids(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<TaskId> {
        self.task_order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .is_some_and(|task| task.is_stale(now, stale_after))
            })
            .copied()
            .collect()
    }
}

/// InMemoryStore は開発用のストア
///
/// # 使用例
/// ```ignore
/// let store = Arc::new(InMemoryStore::new());
/// let task = store.create(NewTask::new("hello-world", json!({}))).await?;
/// let claimed = store.dequeue(10, &worker_id).await?;
/// ```
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store whose timestamps (and staleness checks) follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ids: UlidGenerator::new(clock.clone()),
            clock,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let now = self.clock.now();
        let task = Task {
            id: self.ids.generate_task_id(),
            workflow_name: new_task.workflow_name,
            status: TaskStatus::Pending,
            input: new_task.input,
            output: None,
            error: None,
            priority: new_task.priority,
            scheduled_at: new_task.scheduled_at,
            heartbeat_at: None,
            worker_id: None,
            retry_count: 0,
            max_retries: new_task.max_retries,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut state = self.state.lock().await;
        state.task_order.push(task.id);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.task_mut(id)?;
        task.status = status;
        task.updated_at = now;
        Ok(())
    }

    async fn update_heartbeat(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.owned_running(id, owner) else {
            return Ok(false);
        };
        task.heartbeat_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn update_completed(
        &self,
        id: TaskId,
        owner: &WorkerId,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.owned_running(id, owner) else {
            return Ok(false);
        };
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.worker_id = None;
        task.heartbeat_at = None;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &ErrorInfo,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.owned_running(id, owner) else {
            return Ok(false);
        };
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_value());
        task.worker_id = None;
        task.heartbeat_at = None;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        id: TaskId,
        owner: &WorkerId,
        retry: &RetrySchedule,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.owned_running(id, owner) else {
            return Ok(false);
        };
        task.status = TaskStatus::Pending;
        task.scheduled_at = Some(add(now, retry.delay));
        task.error = Some(retry.error_value());
        task.retry_count += 1;
        task.worker_id = None;
        task.heartbeat_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn release(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.owned_running(id, owner) else {
            return Ok(false);
        };
        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.heartbeat_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn dequeue(
        &self,
        batch_size: usize,
        worker_id: &WorkerId,
    ) -> Result<Vec<Task>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut eligible: Vec<&Task> = state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| task.is_claimable(now))
            .collect();
        // stable: insertion order survives equal (priority, created_at)
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        let picked: Vec<TaskId> = eligible.iter().take(batch_size).map(|t| t.id).collect();

        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            let task = state.task_mut(id)?;
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.clone());
            task.heartbeat_at = Some(now);
            task.updated_at = now;
            claimed.push(task.clone());
        }
        Ok(claimed)
    }

    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };
        if !task.status.is_cancellable() {
            return Ok(CancelOutcome::Rejected(task.status));
        }
        task.status = TaskStatus::Cancelled;
        task.worker_id = None;
        task.heartbeat_at = None;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(CancelOutcome::Cancelled)
    }

    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<ReapedTask>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut reaped = Vec::new();
        for id in state.stale_ids(now, stale_after) {
            let task = state.task_mut(id)?;
            if task.retry_count >= task.max_retries {
                continue;
            }
            task.status = TaskStatus::Pending;
            task.worker_id = None;
            task.heartbeat_at = None;
            task.scheduled_at = None;
            task.retry_count += 1;
            task.updated_at = now;
            reaped.push(ReapedTask {
                id,
                workflow_name: task.workflow_name.clone(),
                retry_count: task.retry_count,
                action: ReapAction::Requeued,
            });
        }
        Ok(reaped)
    }

    async fn fail_exhausted(
        &self,
        stale_after: Duration,
        error: &ErrorInfo,
    ) -> Result<Vec<ReapedTask>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut reaped = Vec::new();
        for id in state.stale_ids(now, stale_after) {
            let task = state.task_mut(id)?;
            if task.retry_count < task.max_retries {
                continue;
            }
            task.status = TaskStatus::Failed;
            task.error = Some(error.to_value());
            task.worker_id = None;
            task.heartbeat_at = None;
            task.completed_at = Some(now);
            task.updated_at = now;
            reaped.push(ReapedTask {
                id,
                workflow_name: task.workflow_name.clone(),
                retry_count: task.retry_count,
                action: ReapAction::Failed,
            });
        }
        Ok(reaped)
    }
}

#[async_trait]
impl StepStore for InMemoryStore {
    async fn create_or_find(
        &self,
        task_id: TaskId,
        step_key: &str,
        input: Option<serde_json::Value>,
    ) -> Result<Step, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let key = (task_id, step_key.to_string());
        if let Some(existing) = state.step_keys.get(&key).and_then(|id| state.steps.get(id)) {
            return Ok(existing.clone());
        }

        let step = Step {
            id: self.ids.generate_step_id(),
            task_id,
            step_key: step_key.to_string(),
            status: StepStatus::Running,
            attempt: 1,
            input,
            output: None,
            error: None,
            compensation_fn: None,
            started_at: Some(now),
            completed_at: None,
            compensated_at: None,
            created_at: now,
        };
        state.step_keys.insert(key, step.id);
        state.step_order.push(step.id);
        state.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn find_by_task_and_key(
        &self,
        task_id: TaskId,
        step_key: &str,
    ) -> Result<Option<Step>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .step_keys
            .get(&(task_id, step_key.to_string()))
            .and_then(|id| state.steps.get(id))
            .cloned())
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Step>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .step_order
            .iter()
            .filter_map(|id| state.steps.get(id))
            .filter(|step| step.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn update_completed(
        &self,
        id: StepId,
        output: serde_json::Value,
        compensation_fn: Option<String>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let step = state.step_mut(id)?;
        step.status = StepStatus::Completed;
        step.output = Some(output);
        step.error = None;
        step.compensation_fn = compensation_fn;
        step.completed_at = Some(now);
        Ok(())
    }

    async fn update_failed(&self, id: StepId, error: &ErrorInfo) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let step = state.step_mut(id)?;
        step.status = StepStatus::Failed;
        step.error = Some(error.to_value());
        step.completed_at = Some(now);
        Ok(())
    }

    async fn increment_attempt(&self, id: StepId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let step = state.step_mut(id)?;
        step.attempt += 1;
        step.status = StepStatus::Pending;
        Ok(())
    }

    async fn find_completed_with_compensation(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Step>, StoreError> {
        let state = self.state.lock().await;
        let mut steps: Vec<Step> = state
            .step_order
            .iter()
            .rev()
            .filter_map(|id| state.steps.get(id))
            .filter(|step| step.task_id == task_id && step.needs_compensation())
            .cloned()
            .collect();
        steps.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(steps)
    }

    async fn mark_compensated(&self, id: StepId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.step_mut(id)?.compensated_at = Some(now);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn insert(
        &self,
        task_id: TaskId,
        step_id: StepId,
        error: &ErrorInfo,
    ) -> Result<DeadLetterEntry, StoreError> {
        let entry = DeadLetterEntry {
            id: self.ids.generate_dead_letter_id(),
            task_id,
            step_id,
            error: error.to_value(),
            retry_count: 0,
            created_at: self.clock.now(),
        };
        let mut state = self.state.lock().await;
        state.dead_letter_order.push(entry.id);
        state.dead_letters.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .dead_letter_order
            .iter()
            .filter_map(|id| state.dead_letters.get(id))
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.get(&id).cloned())
    }

    async fn increment_retry_count(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .dead_letters
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.retry_count += 1;
        Ok(())
    }

    async fn delete(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.dead_letters.remove(&id);
        state.dead_letter_order.retain(|other| *other != id);
        Ok(())
    }
}
