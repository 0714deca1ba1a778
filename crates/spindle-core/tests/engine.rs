use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use spindle_core::app::config::HeartbeatInterval;
use spindle_core::app::{
    BackoffPolicy, BuildError, EngineBuilder, EngineConfig, LeaderElector, PollerConfig,
    StepOptions,
};
use spindle_core::domain::{ErrorInfo, NewTask, StepStatus, Task, TaskId, TaskStatus, WorkerId};
use spindle_core::impls::{InMemoryLockStore, InMemoryStore};
use spindle_core::ports::{LockStore, StepStore, TaskStore};
use spindle_core::typed::{WorkflowError, compensation};
use spindle_core::Engine;

fn fast_config(worker: &str) -> EngineConfig {
    EngineConfig {
        worker_id: Some(worker.to_string()),
        poller: PollerConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            ..PollerConfig::default()
        },
        backoff: BackoffPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            ..BackoffPolicy::default()
        },
        ..EngineConfig::default()
    }
}

async fn wait_terminal(engine: &Engine, id: TaskId) -> Task {
    for _ in 0..1000 {
        let task = engine.status(id).await.unwrap().unwrap();
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} did not finish");
}

fn greet(builder: EngineBuilder) -> EngineBuilder {
    builder
        .register_fn("hello-world", |ctx| async move {
            let name = ctx.input["name"].as_str().unwrap_or("World").to_string();
            let message: String = ctx
                .step
                .run("greet", || async move { Ok::<_, ErrorInfo>(format!("Hello, {name}!")) }, StepOptions::new())
                .await?;
            Ok::<_, WorkflowError>(json!({ "message": message }))
        })
        .unwrap()
}

#[tokio::test]
async fn hello_world_runs_end_to_end() {
    let engine = greet(EngineBuilder::new().with_config(fast_config("w1"))).build().unwrap();
    assert!(engine.start().await.unwrap());

    let id = engine.submit("hello-world", json!({ "name": "Ada" })).await.unwrap();
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!({ "message": "Hello, Ada!" })));

    let defaulted = engine.submit("hello-world", json!({})).await.unwrap();
    let task = wait_terminal(&engine, defaulted).await;
    assert_eq!(task.output, Some(json!({ "message": "Hello, World!" })));

    let steps = engine.steps(id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn failing_step_fails_the_task_after_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let engine = EngineBuilder::new()
        .with_config(fast_config("w1"))
        .register_fn("always-fails", move |ctx| {
            let counter = counter.clone();
            async move {
                ctx.step
                    .run(
                        "call",
                        || async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(ErrorInfo::new("upstream down"))
                        },
                        StepOptions::new().retries(2),
                    )
                    .await?;
                Ok::<_, WorkflowError>(Value::Null)
            }
        })
        .unwrap()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine
        .submit_task(NewTask::new("always-fails", json!({})).with_max_retries(5))
        .await
        .unwrap()
        .id;
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error_info().unwrap().message, "upstream down");
    // first attempt plus two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let step = &engine.steps(id).await.unwrap()[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempt, 3);

    engine.shutdown().await;
}

#[tokio::test]
async fn completed_steps_are_not_rerun_after_a_retry() {
    let first = Arc::new(AtomicUsize::new(0));
    let flaky = Arc::new(AtomicUsize::new(0));
    let (a, b) = (first.clone(), flaky.clone());
    let engine = EngineBuilder::new()
        .with_config(fast_config("w1"))
        .register_fn("two-steps", move |ctx| {
            let (a, b) = (a.clone(), b.clone());
            async move {
                let one: u32 = ctx
                    .step
                    .run(
                        "one",
                        || async move {
                            a.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ErrorInfo>(1)
                        },
                        StepOptions::new(),
                    )
                    .await?;
                let two: u32 = ctx
                    .step
                    .run(
                        "two",
                        || async move {
                            if b.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(ErrorInfo::new("transient"))
                            } else {
                                Ok(2)
                            }
                        },
                        StepOptions::new().retries(1),
                    )
                    .await?;
                Ok::<_, WorkflowError>(json!(one + two))
            }
        })
        .unwrap()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine.submit("two-steps", json!({})).await.unwrap();
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!(3)));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(flaky.load(Ordering::SeqCst), 2);
    assert_eq!(task.retry_count, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn unregistered_workflow_fails_immediately() {
    let engine = greet(EngineBuilder::new().with_config(fast_config("w1"))).build().unwrap();
    engine.start().await.unwrap();

    let id = engine.submit("nope", json!({})).await.unwrap();
    let task = wait_terminal(&engine, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.error_info().unwrap().message,
        "Workflow \"nope\" not found. Registered: [hello-world]"
    );
    assert_eq!(task.retry_count, 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..200 {
        store
            .create(NewTask::new("wf", json!({ "i": i })).with_priority(i % 3))
            .await
            .unwrap();
    }

    let mut claimers = Vec::new();
    for w in 0..8 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{w}"));
            let mut mine = Vec::new();
            loop {
                let batch = store.dequeue(7, &worker).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|t| t.id));
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 200);
    assert!(store.dequeue(10, &WorkerId::new("late")).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_or_find_yields_one_row() {
    let store = Arc::new(InMemoryStore::new());
    let task_id = TaskId::generate();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.create_or_find(task_id, "charge", None).await.unwrap().id
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(StepStore::find_by_task(&*store, task_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rollback_compensates_in_reverse_and_dead_letters_failures() {
    let undone = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = undone.clone();
    let engine = EngineBuilder::new()
        .with_config(fast_config("w1"))
        .register_compensation(
            "order:refund",
            compensation(|_| async { Err::<(), _>(ErrorInfo::new("refund api down")) }),
        )
        .register_fn("order", move |ctx| {
            let log = log.clone();
            async move {
                for item in ["reserve", "ship"] {
                    let log = log.clone();
                    ctx.step
                        .run(
                            item,
                            || async move { Ok::<_, ErrorInfo>(json!({ "item": item })) },
                            StepOptions::new().compensate_with(move |output: Value| {
                                let log = log.clone();
                                async move {
                                    log.lock().unwrap().push(output["item"].as_str().unwrap_or("").to_string());
                                    Ok::<_, ErrorInfo>(())
                                }
                            }),
                        )
                        .await?;
                }
                ctx.step
                    .run(
                        "charge",
                        || async { Ok::<_, ErrorInfo>(json!({ "amount": 10 })) },
                        StepOptions::new().compensation_name("order:refund"),
                    )
                    .await?;
                Ok::<_, WorkflowError>(Value::Null)
            }
        })
        .unwrap()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine.submit("order", json!({})).await.unwrap();
    assert_eq!(wait_terminal(&engine, id).await.status, TaskStatus::Completed);

    let result = engine.rollback(id).await.unwrap();
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.compensated, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.final_status, TaskStatus::PartialRollback);
    assert_eq!(*undone.lock().unwrap(), vec!["ship", "reserve"]);

    let dead = engine.dead_letters(id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error["message"], "refund api down");
    assert_eq!(
        engine.status(id).await.unwrap().unwrap().status,
        TaskStatus::PartialRollback
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn crashed_worker_task_is_requeued_and_finished_elsewhere() {
    let store = Arc::new(InMemoryStore::new());
    let task = store
        .create(NewTask::new("hello-world", json!({ "name": "Grace" })))
        .await
        .unwrap();
    // claimed by a worker that then disappears
    store.dequeue(1, &WorkerId::new("crashed")).await.unwrap();

    let mut config = fast_config("survivor");
    config.reaper.stale_threshold = Duration::from_millis(300);
    config.heartbeat_interval = HeartbeatInterval(Duration::from_millis(50));
    config.reaper.interval = Duration::from_millis(50);
    let engine = greet(EngineBuilder::new().with_config(config).with_store(store.clone()))
        .build()
        .unwrap();
    assert!(engine.start().await.unwrap());

    let done = wait_terminal(&engine, task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.retry_count, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn only_one_engine_leads_the_reaper() {
    let locks: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
    let store = Arc::new(InMemoryStore::new());
    let a = EngineBuilder::new()
        .with_config(fast_config("a"))
        .with_store(store.clone())
        .with_lock_store(locks.clone())
        .build()
        .unwrap();
    let b = EngineBuilder::new()
        .with_config(fast_config("b"))
        .with_store(store.clone())
        .with_lock_store(locks.clone())
        .build()
        .unwrap();

    assert!(a.start().await.unwrap());
    assert!(!b.start().await.unwrap());
    assert_eq!(
        locks.holder(spindle_core::app::REAPER_LEADER_KEY).await.unwrap().as_deref(),
        Some("a")
    );

    a.shutdown().await;
    let standby = LeaderElector::new(locks.clone(), "c", Duration::from_secs(30));
    // a released on shutdown; b or c may pick it up, never both
    let c_won = standby.try_become_leader().await.unwrap();
    assert_ne!(c_won, b.reaper().is_leader());

    b.shutdown().await;
    standby.release_leadership().await.unwrap();
}

#[test]
fn engine_refuses_timers_that_cannot_run() {
    let config = EngineConfig {
        heartbeat_interval: HeartbeatInterval(Duration::ZERO),
        ..EngineConfig::default()
    };
    let built = EngineBuilder::new().with_config(config).build();
    assert!(matches!(built, Err(BuildError::Config(_))));
}
