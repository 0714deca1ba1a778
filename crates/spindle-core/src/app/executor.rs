//! WorkflowExecutor - 1 タスクの実行
//!
//! # フロー
//! 1. workflow_name → DynWorkflow を解決（未登録ならリトライなしで failed）
//! 2. StepBroker をこのランタイムで起動し、ハンドラを ExecutionPool で実行
//! 3. 結果を反映: 成功 → completed / Retry → pending (delay) / それ以外 → failed
//!
//! Every write is fenced on `status = running AND worker_id = self`; a write
//! that matches nothing means the reaper or a cancel got there first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::backoff::BackoffPolicy;
use super::bridge;
use super::heartbeat::HeartbeatService;
use super::poller::Dispatcher;
use super::pool::{ExecutionPool, PoolError};
use super::step_runner::{StepRunner, WorkflowContext};
use crate::domain::{ErrorInfo, RetrySchedule, StoreError, Task, WorkerId};
use crate::ports::{StepStore, TaskStore};
use crate::typed::{CompensationRegistry, WorkflowError, WorkflowRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// How an execution ended, from this worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    RetryScheduled { delay: Duration, attempt: u32 },
    Failed(ErrorInfo),
    /// The fenced write matched no row; someone else owns the task now.
    Superseded,
    /// The pool refused the handler; the task went back to pending unchanged.
    Released,
}

pub struct WorkflowExecutor {
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    workflows: Arc<WorkflowRegistry>,
    compensations: Arc<CompensationRegistry>,
    pool: Arc<ExecutionPool>,
    backoff: BackoffPolicy,
    bridge_timeout: Duration,
    worker_id: WorkerId,
}

impl WorkflowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        steps: Arc<dyn StepStore>,
        workflows: Arc<WorkflowRegistry>,
        compensations: Arc<CompensationRegistry>,
        pool: Arc<ExecutionPool>,
        backoff: BackoffPolicy,
        bridge_timeout: Duration,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            tasks,
            steps,
            workflows,
            compensations,
            pool,
            backoff,
            bridge_timeout,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub async fn execute(&self, task: Task) -> Result<ExecutionOutcome, ExecutorError> {
        let task_id = task.id;
        let Some(workflow) = self.workflows.get(&task.workflow_name) else {
            let info = ErrorInfo::new(format!(
                "Workflow \"{}\" not found. Registered: [{}]",
                task.workflow_name,
                self.workflows.list().join(", ")
            ))
            .with_name("WorkflowNotFoundError")
            .with_code("WORKFLOW_NOT_FOUND");
            error!(%task_id, workflow = %task.workflow_name, "workflow not registered");
            return self.fail(&task, info).await;
        };

        let (client, broker) = bridge::channel(task_id, self.bridge_timeout);
        tokio::spawn(broker.serve(self.steps.clone()));

        let runner = StepRunner::new(
            task.workflow_name.clone(),
            client,
            self.compensations.clone(),
            self.backoff.clone(),
        );
        let ctx = WorkflowContext::new(task_id, task.workflow_name.clone(), task.input.clone(), runner);

        info!(%task_id, workflow = %task.workflow_name, "executing task");
        let result = self.pool.run(async move { workflow.run_dyn(ctx).await }).await;

        match result {
            Ok(Ok(output)) => {
                if !self.tasks.update_completed(task_id, &self.worker_id, output).await? {
                    return Ok(self.superseded(&task));
                }
                info!(%task_id, workflow = %task.workflow_name, "task completed");
                Ok(ExecutionOutcome::Completed)
            }
            Ok(Err(WorkflowError::Retry(retry))) => {
                let schedule = RetrySchedule {
                    delay: retry.delay,
                    attempt: retry.attempt,
                    error: retry.error,
                };
                if !self.tasks.schedule_retry(task_id, &self.worker_id, &schedule).await? {
                    return Ok(self.superseded(&task));
                }
                info!(
                    %task_id,
                    step = %retry.step,
                    attempt = retry.attempt,
                    delay_ms = retry.delay.as_millis() as u64,
                    "task suspended for step retry"
                );
                Ok(ExecutionOutcome::RetryScheduled {
                    delay: retry.delay,
                    attempt: retry.attempt,
                })
            }
            Ok(Err(WorkflowError::Failed(info))) => self.fail(&task, info).await,
            Err(PoolError::Panicked(message)) => {
                let info = ErrorInfo::new(format!("workflow panicked: {message}"))
                    .with_name("WorkflowPanic");
                self.fail(&task, info).await
            }
            Err(e @ (PoolError::QueueFull(_) | PoolError::Closed)) => {
                if !self.tasks.release(task_id, &self.worker_id).await? {
                    return Ok(self.superseded(&task));
                }
                warn!(%task_id, error = %e, "execution pool refused task, released");
                Ok(ExecutionOutcome::Released)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(&self, task: &Task, info: ErrorInfo) -> Result<ExecutionOutcome, ExecutorError> {
        if !self.tasks.fail(task.id, &self.worker_id, &info).await? {
            return Ok(self.superseded(task));
        }
        warn!(task_id = %task.id, workflow = %task.workflow_name, error = %info, "task failed");
        Ok(ExecutionOutcome::Failed(info))
    }

    fn superseded(&self, task: &Task) -> ExecutionOutcome {
        warn!(
            task_id = %task.id,
            worker_id = %self.worker_id,
            "task no longer owned by this worker, result dropped"
        );
        ExecutionOutcome::Superseded
    }
}

/// Heartbeat around one execution. What the poller dispatches to.
pub struct TaskRunner {
    executor: Arc<WorkflowExecutor>,
    heartbeat: Arc<HeartbeatService>,
}

impl TaskRunner {
    pub fn new(executor: Arc<WorkflowExecutor>, heartbeat: Arc<HeartbeatService>) -> Self {
        Self { executor, heartbeat }
    }
}

#[async_trait]
impl Dispatcher for TaskRunner {
    async fn dispatch(&self, task: Task) {
        let task_id = task.id;
        self.heartbeat.start(task_id);
        let result = self.executor.execute(task).await;
        self.heartbeat.stop(task_id);
        if let Err(e) = result {
            error!(%task_id, error = %e, "task execution aborted");
        }
    }
}
