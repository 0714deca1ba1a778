//! RollbackOrchestrator - 完了済み step の補償 (Saga)
//!
//! Compensations run newest first. A compensation that is missing from the
//! registry or fails is written to the dead-letter queue and the loop moves
//! on; one bad compensation never blocks the rest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{ErrorInfo, Step, StoreError, TaskId, TaskStatus};
use crate::ports::{DeadLetterStore, StepStore, TaskStore};
use crate::typed::CompensationRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub task_id: TaskId,
    /// Steps that needed compensation when the rollback started.
    pub total_steps: usize,
    pub compensated: usize,
    /// Steps sent to the dead-letter queue.
    pub failed: usize,
    pub final_status: TaskStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Rolling back under a live executor would race its step writes.
    #[error("task {task_id} is still {status}; only finished tasks can be rolled back")]
    NotFinished { task_id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RollbackOrchestrator {
    tasks: Arc<dyn TaskStore>,
    steps: Arc<dyn StepStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    compensations: Arc<CompensationRegistry>,
}

impl RollbackOrchestrator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        steps: Arc<dyn StepStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        compensations: Arc<CompensationRegistry>,
    ) -> Self {
        Self {
            tasks,
            steps,
            dead_letters,
            compensations,
        }
    }

    pub async fn rollback(&self, task_id: TaskId) -> Result<RollbackResult, RollbackError> {
        let task = self
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or(RollbackError::NotFound(task_id))?;
        if !task.status.is_terminal() {
            return Err(RollbackError::NotFinished {
                task_id,
                status: task.status,
            });
        }

        let steps = self.steps.find_completed_with_compensation(task_id).await?;
        let total_steps = steps.len();
        info!(%task_id, steps = total_steps, "rolling back");

        let mut compensated = 0;
        let mut failed = 0;
        for step in steps {
            match self.compensate(&step).await {
                Ok(()) => {
                    self.steps.mark_compensated(step.id).await?;
                    compensated += 1;
                }
                Err(info) => {
                    warn!(%task_id, step = %step.step_key, error = %info, "compensation failed, dead-lettering");
                    self.dead_letters.insert(task_id, step.id, &info).await?;
                    failed += 1;
                }
            }
        }

        let final_status = if failed == 0 {
            TaskStatus::RolledBack
        } else {
            TaskStatus::PartialRollback
        };
        self.tasks.update_status(task_id, final_status).await?;
        if failed == 0 {
            info!(%task_id, compensated, "rollback finished");
        } else {
            error!(%task_id, compensated, failed, "rollback finished with dead letters");
        }

        Ok(RollbackResult {
            task_id,
            total_steps,
            compensated,
            failed,
            final_status,
        })
    }

    async fn compensate(&self, step: &Step) -> Result<(), ErrorInfo> {
        let name = step.compensation_fn.as_deref().unwrap_or_default();
        let Some(f) = self.compensations.get(name) else {
            return Err(ErrorInfo::new(format!("Compensation \"{name}\" is not registered"))
                .with_name("CompensationNotFound")
                .with_code("COMPENSATION_NOT_FOUND"));
        };
        let output = step.output.clone().unwrap_or(serde_json::Value::Null);

        // f is called inside the task so a panic before its first await is caught too
        match tokio::spawn(async move { f(output).await }).await {
            Ok(result) => result,
            Err(e) => Err(ErrorInfo::new(format!("compensation panicked: {e}"))
                .with_name("CompensationPanic")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, WorkerId};
    use crate::impls::InMemoryStore;
    use crate::typed::{compensation, CompensationFn};
    use serde_json::json;
    use std::sync::Mutex;

    async fn finished_task_with_steps(store: &InMemoryStore, keys: &[&str]) -> TaskId {
        let task = store.create(NewTask::new("order", json!({}))).await.unwrap();
        let worker = WorkerId::new("w1");
        store.dequeue(1, &worker).await.unwrap();
        for key in keys {
            let step = store.create_or_find(task.id, key, None).await.unwrap();
            StepStore::update_completed(store, step.id, json!({ "key": key }), Some(format!("order:{key}")))
                .await
                .unwrap();
        }
        TaskStore::update_completed(store, task.id, &worker, json!({})).await.unwrap();
        task.id
    }

    fn orchestrator(store: Arc<InMemoryStore>, registry: Arc<CompensationRegistry>) -> RollbackOrchestrator {
        RollbackOrchestrator::new(store.clone(), store.clone(), store, registry)
    }

    #[tokio::test]
    async fn compensates_newest_first_and_dead_letters_failures() {
        let store = Arc::new(InMemoryStore::new());
        let task_id = finished_task_with_steps(&store, &["reserve", "charge", "ship"]).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(CompensationRegistry::new());
        for key in ["reserve", "ship"] {
            let order = order.clone();
            registry.register(
                format!("order:{key}"),
                compensation(move |output| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(output["key"].as_str().unwrap_or("").to_string());
                        Ok::<_, ErrorInfo>(())
                    }
                }),
            );
        }
        registry.register(
            "order:charge",
            compensation(|_| async { Err::<(), _>(ErrorInfo::new("refund api down")) }),
        );

        let result = orchestrator(store.clone(), registry).rollback(task_id).await.unwrap();
        assert_eq!(result.total_steps, 3);
        assert_eq!(result.compensated, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.final_status, TaskStatus::PartialRollback);
        assert_eq!(*order.lock().unwrap(), vec!["ship", "reserve"]);

        let dead = DeadLetterStore::find_by_task(&*store, task_id).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error["message"], "refund api down");

        let task = TaskStore::find_by_id(&*store, task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::PartialRollback);
    }

    #[tokio::test]
    async fn unregistered_compensation_is_dead_lettered() {
        let store = Arc::new(InMemoryStore::new());
        let task_id = finished_task_with_steps(&store, &["charge"]).await;

        let result = orchestrator(store.clone(), Arc::new(CompensationRegistry::new()))
            .rollback(task_id)
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        let dead = DeadLetterStore::find_by_task(&*store, task_id).await.unwrap();
        assert_eq!(dead[0].error["code"], "COMPENSATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn nothing_to_compensate_is_a_clean_rollback() {
        let store = Arc::new(InMemoryStore::new());
        let task_id = finished_task_with_steps(&store, &[]).await;

        let result = orchestrator(store.clone(), Arc::new(CompensationRegistry::new()))
            .rollback(task_id)
            .await
            .unwrap();
        assert_eq!(result.total_steps, 0);
        assert_eq!(result.final_status, TaskStatus::RolledBack);
    }

    #[tokio::test]
    async fn running_task_is_refused() {
        let store = Arc::new(InMemoryStore::new());
        let task = store.create(NewTask::new("order", json!({}))).await.unwrap();
        store.dequeue(1, &WorkerId::new("w1")).await.unwrap();

        let err = orchestrator(store.clone(), Arc::new(CompensationRegistry::new()))
            .rollback(task.id)
            .await
            .unwrap_err();
        assert!(matches!(err, RollbackError::NotFinished { status: TaskStatus::Running, .. }));
    }

    #[tokio::test]
    async fn panicking_compensation_does_not_stop_the_rest() {
        let store = Arc::new(InMemoryStore::new());
        let task_id = finished_task_with_steps(&store, &["a", "b"]).await;
        let registry = Arc::new(CompensationRegistry::new());
        registry.register(
            "order:b",
            compensation(|_| async {
                if true {
                    panic!("bad compensation");
                }
                Ok::<_, ErrorInfo>(())
            }),
        );
        registry.register("order:a", compensation(|_| async { Ok::<_, ErrorInfo>(()) }));

        let result = orchestrator(store.clone(), registry).rollback(task_id).await.unwrap();
        assert_eq!((result.compensated, result.failed), (1, 1));
        let dead = DeadLetterStore::find_by_task(&*store, task_id).await.unwrap();
        assert_eq!(dead[0].error["name"], "CompensationPanic");
    }

    #[tokio::test]
    async fn compensation_panicking_before_its_future_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let task_id = finished_task_with_steps(&store, &["a", "b"]).await;
        let registry = Arc::new(CompensationRegistry::new());
        let eager: CompensationFn = Arc::new(
            |_output: serde_json::Value| -> crate::typed::compensation::CompensationFuture {
                panic!("bad compensation setup")
            },
        );
        registry.register("order:b", eager);
        registry.register("order:a", compensation(|_| async { Ok::<_, ErrorInfo>(()) }));

        let result = orchestrator(store.clone(), registry).rollback(task_id).await.unwrap();
        assert_eq!((result.compensated, result.failed), (1, 1));
        assert_eq!(result.final_status, TaskStatus::PartialRollback);
        let dead = DeadLetterStore::find_by_task(&*store, task_id).await.unwrap();
        assert_eq!(dead[0].error["name"], "CompensationPanic");
    }
}
