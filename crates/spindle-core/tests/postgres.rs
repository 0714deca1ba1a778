//! Store behaviour against a real Postgres.
//!
//! ```text
//! DATABASE_URL=postgres://localhost/spindle_test cargo test --test postgres -- --ignored
//! ```
//! Every test truncates the tables, so point this at a scratch database.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use spindle_core::app::{EngineBuilder, EngineConfig, PollerConfig, StepOptions};
use spindle_core::domain::{ErrorInfo, NewTask, ReapAction, TaskId, TaskStatus, WorkerId};
use spindle_core::impls::PgStore;
use spindle_core::ports::{StepStore, TaskStore};
use spindle_core::typed::WorkflowError;

// tests share one database
static DB: Mutex<()> = Mutex::const_new(());

async fn store() -> (MutexGuard<'static, ()>, Arc<PgStore>) {
    let guard = DB.lock().await;
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres tests");
    let store = PgStore::connect(&url, 20).await.unwrap();
    store.migrate().await.unwrap();
    sqlx::query("TRUNCATE tasks, steps, dead_letters")
        .execute(store.pool())
        .await
        .unwrap();
    (guard, Arc::new(store))
}

async fn age_heartbeat(store: &PgStore, id: TaskId, by: Duration) {
    sqlx::query(
        "UPDATE tasks SET heartbeat_at = NOW() - ($2::bigint * INTERVAL '1 millisecond') WHERE id = $1",
    )
    .bind(id.to_key())
    .bind(by.as_millis() as i64)
    .execute(store.pool())
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claims_are_disjoint() {
    let (_db, store) = store().await;
    for i in 0..60 {
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
            let batch = store.dequeue(5, &worker).await.unwrap();
            (worker, batch)
        }));
    }

    let mut seen = HashSet::new();
    for claimer in claimers {
        let (worker, batch) = claimer.await.unwrap();
        for task in batch {
            assert!(seen.insert(task.id), "task {} claimed twice", task.id);
            assert_eq!(task.status, TaskStatus::Running);
            assert_eq!(task.worker_id.as_ref(), Some(&worker));
            assert!(task.heartbeat_at.is_some());
        }
    }
    assert_eq!(seen.len(), 40);

    let (running,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = 'running'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(running, 40);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn claim_respects_priority_and_schedule() {
    let (_db, store) = store().await;
    let low = store.create(NewTask::new("wf", json!({}))).await.unwrap();
    let high = store
        .create(NewTask::new("wf", json!({})).with_priority(5))
        .await
        .unwrap();
    store
        .create(NewTask::new("wf", json!({})).scheduled_at(chrono::Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    let claimed = store.dequeue(10, &WorkerId::new("w1")).await.unwrap();
    let ids: Vec<_> = claimed.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![high.id, low.id]);
    assert!(store.dequeue(10, &WorkerId::new("w2")).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_create_or_find_yields_one_row() {
    let (_db, store) = store().await;
    let task = store.create(NewTask::new("wf", json!({}))).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.create_or_find(task.id, "charge", None).await.unwrap().id
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(StepStore::find_by_task(&*store, task.id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn reaper_statements_requeue_then_fail() {
    let (_db, store) = store().await;
    let retryable = store.create(NewTask::new("wf", json!({}))).await.unwrap();
    let exhausted = store
        .create(NewTask::new("wf", json!({})).with_max_retries(0))
        .await
        .unwrap();
    let fresh = store.create(NewTask::new("wf", json!({}))).await.unwrap();
    store.dequeue(3, &WorkerId::new("w1")).await.unwrap();
    age_heartbeat(&store, retryable.id, Duration::from_secs(600)).await;
    age_heartbeat(&store, exhausted.id, Duration::from_secs(600)).await;

    let stale_after = Duration::from_secs(300);
    let requeued = store.requeue_stale(stale_after).await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].id, retryable.id);
    assert_eq!(requeued[0].retry_count, 1);
    assert_eq!(requeued[0].action, ReapAction::Requeued);

    let failed = store
        .fail_exhausted(stale_after, &ErrorInfo::max_retries_exceeded())
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, exhausted.id);

    let row = TaskStore::find_by_id(&*store, retryable.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!((row.worker_id, row.heartbeat_at, row.scheduled_at), (None, None, None));

    let row = TaskStore::find_by_id(&*store, exhausted.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.error_info().unwrap().code.as_deref(), Some("MAX_RETRIES_EXCEEDED"));
    assert!(row.completed_at.is_some());

    let row = TaskStore::find_by_id(&*store, fresh.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Running);

    // a second sweep finds nothing
    assert!(store.requeue_stale(stale_after).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn owner_fenced_writes() {
    let (_db, store) = store().await;
    let task = store.create(NewTask::new("wf", json!({}))).await.unwrap();
    let owner = WorkerId::new("owner");
    let other = WorkerId::new("other");
    store.dequeue(1, &owner).await.unwrap();

    assert!(!store.update_heartbeat(task.id, &other).await.unwrap());
    assert!(store.update_heartbeat(task.id, &owner).await.unwrap());
    assert!(!TaskStore::update_completed(&*store, task.id, &other, json!(1)).await.unwrap());

    assert!(store.release(task.id, &owner).await.unwrap());
    let row = TaskStore::find_by_id(&*store, task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert!(!store.release(task.id, &owner).await.unwrap());
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn hello_world_runs_on_postgres() {
    let (_db, store) = store().await;
    let config = EngineConfig {
        worker_id: Some("pg-w1".into()),
        poller: PollerConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            ..PollerConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = EngineBuilder::new()
        .with_config(config)
        .with_store(store.clone())
        .register_fn("hello-world", |ctx| async move {
            let name = ctx.input["name"].as_str().unwrap_or("World").to_string();
            let message: String = ctx
                .step
                .run("greet", || async move { Ok::<_, ErrorInfo>(format!("Hello, {name}!")) }, StepOptions::new())
                .await?;
            Ok::<_, WorkflowError>(json!({ "message": message }))
        })
        .unwrap()
        .build()
        .unwrap();
    engine.start().await.unwrap();

    let id = engine.submit("hello-world", json!({ "name": "Ada" })).await.unwrap();
    let mut task = None;
    for _ in 0..500 {
        let row = engine.status(id).await.unwrap().unwrap();
        if row.status.is_terminal() {
            task = Some(row);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let task = task.expect("task did not finish");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output, Some(json!({ "message": "Hello, Ada!" })));

    let steps = engine.steps(id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert!(steps[0].is_completed());

    engine.shutdown().await;
}
