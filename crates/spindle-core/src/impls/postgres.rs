//! Postgres-backed stores.
//!
//! `PgStore` implements `TaskStore`, `StepStore` and `DeadLetterStore` on one
//! connection pool. Every state transition is a single conditional
//! `UPDATE … RETURNING` (or `INSERT … ON CONFLICT`), so concurrent workers
//! never need client-side locking.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Database` |
//! | PoolClosed / Io / other | N/A | `Database` |
//! | ColumnDecode | N/A | `Decode` |
//!
//! Timestamps written by these statements come from the database clock
//! (`NOW()`), which keeps staleness checks consistent across workers.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::domain::ids::{Id, IdMarker};
use crate::domain::{
    CancelOutcome, DeadLetterEntry, DeadLetterId, ErrorInfo, NewTask, ReapAction, ReapedTask,
    RetrySchedule, Step, StepId, StepStatus, StoreError, Task, TaskId, TaskStatus, WorkerId,
};
use crate::ports::{DeadLetterStore, IdGenerator, StepStore, SystemClock, TaskStore, UlidGenerator};

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const TASK_COLUMNS: &str = "id, workflow_name, status, input, output, error, priority, \
     scheduled_at, heartbeat_at, worker_id, retry_count, max_retries, \
     created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "id, task_id, step_key, status, attempt, input, output, error, \
     compensation_fn, started_at, completed_at, compensated_at, created_at";

const DEAD_LETTER_COLUMNS: &str = "id, task_id, step_id, error, retry_count, created_at";

/// Postgres implementation of the storage ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    ids: Arc<UlidGenerator<SystemClock>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `tasks`, `steps` and `dead_letters` tables if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ========================================
// Row decoding
// ========================================

fn parse_id<T: IdMarker>(raw: &str) -> Result<Id<T>, StoreError> {
    Id::<T>::from_str(raw).map_err(|e| StoreError::Decode(format!("bad id {raw:?}: {e}")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = get(row, "status")?;
    let worker_id: Option<String> = get(row, "worker_id")?;
    Ok(Task {
        id: parse_id(&get::<String>(row, "id")?)?,
        workflow_name: get(row, "workflow_name")?,
        status: TaskStatus::from_str(&status).map_err(StoreError::Decode)?,
        input: get(row, "input")?,
        output: get(row, "output")?,
        error: get(row, "error")?,
        priority: get(row, "priority")?,
        scheduled_at: get(row, "scheduled_at")?,
        heartbeat_at: get(row, "heartbeat_at")?,
        worker_id: worker_id.map(WorkerId::new),
        retry_count: to_u32(get(row, "retry_count")?, "retry_count")?,
        max_retries: to_u32(get(row, "max_retries")?, "max_retries")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<Step, StoreError> {
    let status: String = get(row, "status")?;
    Ok(Step {
        id: parse_id(&get::<String>(row, "id")?)?,
        task_id: parse_id(&get::<String>(row, "task_id")?)?,
        step_key: get(row, "step_key")?,
        status: StepStatus::from_str(&status).map_err(StoreError::Decode)?,
        attempt: to_u32(get(row, "attempt")?, "attempt")?,
        input: get(row, "input")?,
        output: get(row, "output")?,
        error: get(row, "error")?,
        compensation_fn: get(row, "compensation_fn")?,
        started_at: get(row, "started_at")?,
        completed_at: get(row, "completed_at")?,
        compensated_at: get(row, "compensated_at")?,
        created_at: get(row, "created_at")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    Ok(DeadLetterEntry {
        id: parse_id(&get::<String>(row, "id")?)?,
        task_id: parse_id(&get::<String>(row, "task_id")?)?,
        step_id: parse_id(&get::<String>(row, "step_id")?)?,
        error: get(row, "error")?,
        retry_count: to_u32(get(row, "retry_count")?, "retry_count")?,
        created_at: get(row, "created_at")?,
    })
}

fn reaped_from_row(row: &PgRow, action: ReapAction) -> Result<ReapedTask, StoreError> {
    Ok(ReapedTask {
        id: parse_id(&get::<String>(row, "id")?)?,
        workflow_name: get(row, "workflow_name")?,
        retry_count: to_u32(get(row, "retry_count")?, "retry_count")?,
        action,
    })
}

// ========================================
// TaskStore
// ========================================

#[async_trait]
impl TaskStore for PgStore {
    async fn create(&self, new_task: NewTask) -> Result<Task, StoreError> {
        let sql = format!(
            "INSERT INTO tasks (id, workflow_name, status, input, priority, max_retries, scheduled_at) \
             VALUES ($1, $2, 'pending', $3, $4, $5, $6) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(self.ids.generate_task_id().to_key())
            .bind(&new_task.workflow_name)
            .bind(&new_task.input)
            .bind(new_task.priority)
            .bind(to_i32(new_task.max_retries))
            .bind(new_task.scheduled_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_task", e))?;
        task_from_row(&row)
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.to_key())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_task_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_heartbeat(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.to_key())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_completed(
        &self,
        id: TaskId,
        owner: &WorkerId,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'completed', output = $3, worker_id = NULL, heartbeat_at = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.to_key())
        .bind(owner.as_str())
        .bind(&output)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_task", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: TaskId,
        owner: &WorkerId,
        error: &ErrorInfo,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'failed', error = $3, worker_id = NULL, heartbeat_at = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.to_key())
        .bind(owner.as_str())
        .bind(error.to_value())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_task", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        id: TaskId,
        owner: &WorkerId,
        retry: &RetrySchedule,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', \
                 scheduled_at = NOW() + ($3::bigint * INTERVAL '1 millisecond'), \
                 error = $4, retry_count = retry_count + 1, \
                 worker_id = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.to_key())
        .bind(owner.as_str())
        .bind(millis(retry.delay))
        .bind(retry.error_value())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("schedule_retry", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, owner), fields(worker_id = %owner), err)]
    async fn release(&self, id: TaskId, owner: &WorkerId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', worker_id = NULL, heartbeat_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND worker_id = $2",
        )
        .bind(id.to_key())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_task", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn dequeue(
        &self,
        batch_size: usize,
        worker_id: &WorkerId,
    ) -> Result<Vec<Task>, StoreError> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "WITH next_tasks AS ( \
                 SELECT id FROM tasks \
                 WHERE status = 'pending' \
                   AND (scheduled_at IS NULL OR scheduled_at <= NOW()) \
                 ORDER BY priority DESC, created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE tasks t \
             SET status = 'running', worker_id = $2, heartbeat_at = NOW(), updated_at = NOW() \
             FROM next_tasks \
             WHERE t.id = next_tasks.id \
             RETURNING {}",
            TASK_COLUMNS
                .split(", ")
                .map(|c| format!("t.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(worker_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, StoreError> {
        let updated = sqlx::query(
            "UPDATE tasks \
             SET status = 'cancelled', worker_id = NULL, heartbeat_at = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'running') \
             RETURNING id",
        )
        .bind(id.to_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_task", e))?;
        if updated.is_some() {
            return Ok(CancelOutcome::Cancelled);
        }

        match TaskStore::find_by_id(self, id).await? {
            Some(task) => Ok(CancelOutcome::Rejected(task.status)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<ReapedTask>, StoreError> {
        let rows = sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', worker_id = NULL, heartbeat_at = NULL, scheduled_at = NULL, \
                 retry_count = retry_count + 1, updated_at = NOW() \
             WHERE status = 'running' \
               AND heartbeat_at < NOW() - ($1::bigint * INTERVAL '1 millisecond') \
               AND retry_count < max_retries \
             RETURNING id, workflow_name, retry_count",
        )
        .bind(millis(stale_after))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;
        rows.iter()
            .map(|row| reaped_from_row(row, ReapAction::Requeued))
            .collect()
    }

    #[instrument(skip(self, error), err)]
    async fn fail_exhausted(
        &self,
        stale_after: Duration,
        error: &ErrorInfo,
    ) -> Result<Vec<ReapedTask>, StoreError> {
        let rows = sqlx::query(
            "UPDATE tasks \
             SET status = 'failed', error = $2, worker_id = NULL, heartbeat_at = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE status = 'running' \
               AND heartbeat_at < NOW() - ($1::bigint * INTERVAL '1 millisecond') \
               AND retry_count >= max_retries \
             RETURNING id, workflow_name, retry_count",
        )
        .bind(millis(stale_after))
        .bind(error.to_value())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_exhausted", e))?;
        rows.iter()
            .map(|row| reaped_from_row(row, ReapAction::Failed))
            .collect()
    }
}

// ========================================
// StepStore
// ========================================

#[async_trait]
impl StepStore for PgStore {
    async fn create_or_find(
        &self,
        task_id: TaskId,
        step_key: &str,
        input: Option<serde_json::Value>,
    ) -> Result<Step, StoreError> {
        let sql = format!(
            "INSERT INTO steps (id, task_id, step_key, status, attempt, input, started_at) \
             VALUES ($1, $2, $3, 'running', 1, $4, NOW()) \
             ON CONFLICT (task_id, step_key) DO NOTHING \
             RETURNING {STEP_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(self.ids.generate_step_id().to_key())
            .bind(task_id.to_key())
            .bind(step_key)
            .bind(&input)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_step", e))?;
        if let Some(row) = inserted {
            return step_from_row(&row);
        }

        // lost the insert race; the winner's row is committed
        self.find_by_task_and_key(task_id, step_key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{task_id}/{step_key}")))
    }

    async fn find_by_task_and_key(
        &self,
        task_id: TaskId,
        step_key: &str,
    ) -> Result<Option<Step>, StoreError> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE task_id = $1 AND step_key = $2");
        let row = sqlx::query(&sql)
            .bind(task_id.to_key())
            .bind(step_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_step", e))?;
        row.as_ref().map(step_from_row).transpose()
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<Step>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id.to_key())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_steps", e))?;
        rows.iter().map(step_from_row).collect()
    }

    async fn update_completed(
        &self,
        id: StepId,
        output: serde_json::Value,
        compensation_fn: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps \
             SET status = 'completed', output = $2, error = NULL, compensation_fn = $3, \
                 completed_at = NOW() \
             WHERE id = $1",
        )
        .bind(id.to_key())
        .bind(&output)
        .bind(compensation_fn)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_step", e))?;
        Ok(())
    }

    async fn update_failed(&self, id: StepId, error: &ErrorInfo) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE steps SET status = 'failed', error = $2, completed_at = NOW() WHERE id = $1",
        )
        .bind(id.to_key())
        .bind(error.to_value())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_step", e))?;
        Ok(())
    }

    async fn increment_attempt(&self, id: StepId) -> Result<(), StoreError> {
        sqlx::query("UPDATE steps SET attempt = attempt + 1, status = 'pending' WHERE id = $1")
            .bind(id.to_key())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_step_attempt", e))?;
        Ok(())
    }

    async fn find_completed_with_compensation(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<Step>, StoreError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM steps \
             WHERE task_id = $1 AND status = 'completed' \
               AND compensation_fn IS NOT NULL AND compensated_at IS NULL \
             ORDER BY completed_at DESC, created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id.to_key())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_compensations", e))?;
        rows.iter().map(step_from_row).collect()
    }

    async fn mark_compensated(&self, id: StepId) -> Result<(), StoreError> {
        sqlx::query("UPDATE steps SET compensated_at = NOW() WHERE id = $1")
            .bind(id.to_key())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_compensated", e))?;
        Ok(())
    }
}

// ========================================
// DeadLetterStore
// ========================================

#[async_trait]
impl DeadLetterStore for PgStore {
    async fn insert(
        &self,
        task_id: TaskId,
        step_id: StepId,
        error: &ErrorInfo,
    ) -> Result<DeadLetterEntry, StoreError> {
        let sql = format!(
            "INSERT INTO dead_letters (id, task_id, step_id, error) VALUES ($1, $2, $3, $4) \
             RETURNING {DEAD_LETTER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(self.ids.generate_dead_letter_id().to_key())
            .bind(task_id.to_key())
            .bind(step_id.to_key())
            .bind(error.to_value())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
        dead_letter_from_row(&row)
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE task_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_id.to_key())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn find_by_id(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_dead_letter", e))?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn increment_retry_count(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE dead_letters SET retry_count = retry_count + 1 WHERE id = $1")
                .bind(id.to_key())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("increment_dead_letter", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: DeadLetterId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id.to_key())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;
        Ok(())
    }
}

/// Map SQLx errors by Postgres error code.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::database(operation, db_err.message()),
            }
        }
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Decode(format!("{operation}: column {index}: {source}"))
        }
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        other => StoreError::database(operation, other.to_string()),
    }
}
