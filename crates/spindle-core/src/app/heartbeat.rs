//! HeartbeatService - 実行中タスクの生存通知
//!
//! One timer per running task. Each tick writes `heartbeat_at = now` for
//! that task only, so a wedged task stops beating even while its siblings
//! on the same worker keep going. Beats are fenced on this worker's id; a
//! task the reaper handed to someone else is never kept alive from here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{TaskId, WorkerId};
use crate::ports::TaskStore;

pub struct HeartbeatService {
    store: Arc<dyn TaskStore>,
    interval: Duration,
    worker_id: WorkerId,
    timers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
}

impl HeartbeatService {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration, worker_id: WorkerId) -> Self {
        Self {
            store,
            interval,
            worker_id,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Start beating for `task_id`; a second call for the same id is a no-op.
    ///
    /// The first beat is written immediately.
    pub fn start(&self, task_id: TaskId) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.contains_key(&task_id) {
            return;
        }

        let store = self.store.clone();
        let period = self.interval;
        let owner = self.worker_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.update_heartbeat(task_id, &owner).await {
                    Ok(true) => {}
                    Ok(false) => debug!(%task_id, worker_id = %owner, "heartbeat skipped, task no longer ours"),
                    Err(e) => warn!(%task_id, error = %e, "heartbeat write failed"),
                }
            }
        });
        timers.insert(task_id, handle);
        debug!(%task_id, interval_ms = period.as_millis() as u64, "heartbeat started");
    }

    pub fn stop(&self, task_id: TaskId) {
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        if let Some(handle) = handle {
            handle.abort();
            debug!(%task_id, "heartbeat stopped");
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, handle) in drained {
            handle.abort();
        }
    }

    pub fn is_tracking(&self, task_id: TaskId) -> bool {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.timers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for HeartbeatService {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, WorkerId};
    use crate::impls::InMemoryStore;
    use crate::ports::{Clock, FixedClock, TaskStore};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn beats_until_stopped() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let task = store.create(NewTask::new("wf", json!({}))).await.unwrap();
        store.dequeue(1, &WorkerId::new("w")).await.unwrap();

        let heartbeat = HeartbeatService::new(store.clone(), Duration::from_secs(5), WorkerId::new("w"));
        heartbeat.start(task.id);
        heartbeat.start(task.id);
        assert_eq!(heartbeat.len(), 1);

        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let beat = TaskStore::find_by_id(&*store, task.id).await.unwrap().unwrap().heartbeat_at;
        assert_eq!(beat, Some(clock.now()));

        heartbeat.stop(task.id);
        assert!(!heartbeat.is_tracking(task.id));

        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(10)).await;
        let after = TaskStore::find_by_id(&*store, task.id).await.unwrap().unwrap().heartbeat_at;
        assert_eq!(after, beat);
    }

    #[tokio::test]
    async fn stop_all_clears_every_timer() {
        let store = Arc::new(InMemoryStore::new());
        let heartbeat = HeartbeatService::new(store, Duration::from_secs(5), WorkerId::new("w"));
        heartbeat.start(TaskId::generate());
        heartbeat.start(TaskId::generate());
        assert_eq!(heartbeat.len(), 2);

        heartbeat.stop_all();
        assert!(heartbeat.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn previous_owner_cannot_refresh_a_reclaimed_task() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let task = store.create(NewTask::new("wf", json!({}))).await.unwrap();
        store.dequeue(1, &WorkerId::new("old")).await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.requeue_stale(Duration::from_secs(30)).await.unwrap().len(), 1);
        store.dequeue(1, &WorkerId::new("new")).await.unwrap();
        let claimed_at = clock.now();

        // the old worker's timer was never stopped
        let zombie = HeartbeatService::new(store.clone(), Duration::from_secs(5), WorkerId::new("old"));
        zombie.start(task.id);
        clock.advance(Duration::from_secs(20));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let row = TaskStore::find_by_id(&*store, task.id).await.unwrap().unwrap();
        assert_eq!(row.worker_id, Some(WorkerId::new("new")));
        assert_eq!(row.heartbeat_at, Some(claimed_at));
        zombie.stop_all();
    }
}
