//! Engine - 投入 API とライフサイクル
//!
//! Built by [`EngineBuilder`](super::builder::EngineBuilder). `start` launches
//! the poller, the reaper and the lag monitor; `shutdown` stops scheduling,
//! waits for dispatched tasks and then tears the execution pool down.

use std::sync::Arc;

use tracing::info;

use super::backpressure::LagMonitor;
use super::config::EngineConfig;
use super::executor::WorkflowExecutor;
use super::heartbeat::HeartbeatService;
use super::poller::Poller;
use super::pool::ExecutionPool;
use super::reaper_loop::ReaperLoop;
use super::rollback::{RollbackError, RollbackOrchestrator, RollbackResult};
use crate::domain::{
    CancelOutcome, DeadLetterEntry, NewTask, Step, StoreError, Task, TaskId, TaskStatus, WorkerId,
};
use crate::ports::{DeadLetterStore, LockError, StepStore, TaskStore};
use crate::typed::{CompensationRegistry, WorkflowRegistry};

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id} cannot be cancelled: status is {status}")]
    NotCancellable { task_id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) struct Parts {
    pub worker_id: WorkerId,
    pub config: EngineConfig,
    pub tasks: Arc<dyn TaskStore>,
    pub steps: Arc<dyn StepStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub workflows: Arc<WorkflowRegistry>,
    pub compensations: Arc<CompensationRegistry>,
    pub pool: Arc<ExecutionPool>,
    pub heartbeat: Arc<HeartbeatService>,
    pub lag: Arc<LagMonitor>,
    pub executor: Arc<WorkflowExecutor>,
    pub poller: Poller,
    pub reaper: ReaperLoop,
    pub rollback: RollbackOrchestrator,
}

pub struct Engine {
    worker_id: WorkerId,
    config: EngineConfig,
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    workflows: Arc<WorkflowRegistry>,
    compensations: Arc<CompensationRegistry>,
    pool: Arc<ExecutionPool>,
    heartbeat: Arc<HeartbeatService>,
    lag: Arc<LagMonitor>,
    executor: Arc<WorkflowExecutor>,
    poller: Poller,
    reaper: ReaperLoop,
    rollback: RollbackOrchestrator,
}

impl Engine {
    pub(crate) fn new(parts: Parts) -> Self {
        let Parts {
            worker_id,
            config,
            tasks,
            steps,
            dead_letters,
            workflows,
            compensations,
            pool,
            heartbeat,
            lag,
            executor,
            poller,
            reaper,
            rollback,
        } = parts;
        Self {
            worker_id,
            config,
            tasks,
            steps,
            dead_letters,
            workflows,
            compensations,
            pool,
            heartbeat,
            lag,
            executor,
            poller,
            reaper,
            rollback,
        }
    }

    /// Start polling, the reaper and lag sampling.
    ///
    /// Returns whether this instance became reaper leader.
    pub async fn start(&self) -> Result<bool, LockError> {
        self.lag.start();
        self.poller.start();
        let leader = self.reaper.start().await?;
        info!(
            worker_id = %self.worker_id,
            leader,
            workflows = ?self.workflows.list(),
            "engine started"
        );
        Ok(leader)
    }

    /// Stop scheduling, let dispatched tasks finish, then close the pool.
    pub async fn shutdown(&self) {
        info!(worker_id = %self.worker_id, "engine shutting down");
        self.poller.stop().await;
        self.reaper.stop().await;
        self.poller.drain().await;
        self.heartbeat.stop_all();
        self.pool.shutdown().await;
        self.lag.stop();
        info!(worker_id = %self.worker_id, "engine stopped");
    }

    pub async fn submit(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
    ) -> Result<TaskId, StoreError> {
        Ok(self.submit_task(NewTask::new(workflow_name, input)).await?.id)
    }

    pub async fn submit_task(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let task = self.tasks.create(new_task).await?;
        info!(task_id = %task.id, workflow = %task.workflow_name, "task submitted");
        Ok(task)
    }

    pub async fn status(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.tasks.find_by_id(task_id).await
    }

    /// Accepted only while the task is pending or running.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), CancelError> {
        match self.tasks.cancel(task_id).await? {
            CancelOutcome::Cancelled => {
                info!(%task_id, "task cancelled");
                Ok(())
            }
            CancelOutcome::Rejected(status) => Err(CancelError::NotCancellable { task_id, status }),
            CancelOutcome::NotFound => Err(CancelError::NotFound(task_id)),
        }
    }

    pub async fn rollback(&self, task_id: TaskId) -> Result<RollbackResult, RollbackError> {
        self.rollback.rollback(task_id).await
    }

    pub async fn dead_letters(&self, task_id: TaskId) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.dead_letters.find_by_task(task_id).await
    }

    pub async fn steps(&self, task_id: TaskId) -> Result<Vec<Step>, StoreError> {
        self.steps.find_by_task(task_id).await
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn compensations(&self) -> &CompensationRegistry {
        &self.compensations
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn reaper(&self) -> &ReaperLoop {
        &self.reaper
    }
}
