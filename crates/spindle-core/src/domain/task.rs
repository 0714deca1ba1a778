//! Task: one durable workflow invocation and its queue state.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorInfo;
use super::ids::{TaskId, WorkerId};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task status.
///
/// State transitions:
/// - Pending -> Running (claim)
/// - Running -> Completed | Failed | Pending (executor; pending = step retry)
/// - Running -> Pending | Failed (reaper)
/// - Pending | Running -> Cancelled (submission API)
/// - terminal -> RolledBack | PartialRollback (rollback orchestrator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
    PartialRollback,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::RolledBack => "rolled_back",
            TaskStatus::PartialRollback => "partial_rollback",
        }
    }

    /// No executor or reaper will touch the row again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// Cancellation is only accepted before the task has finished.
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "rolled_back" => TaskStatus::RolledBack,
            "partial_rollback" => TaskStatus::PartialRollback,
            other => return Err(format!("unknown task status: {other}")),
        })
    }
}

/// A row of the `tasks` table.
///
/// Invariant: `worker_id` and `heartbeat_at` are `Some` iff `status == Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow_name: String,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Eligible for a claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Running, but the last heartbeat is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return false;
        };
        self.status == TaskStatus::Running
            && self.heartbeat_at.is_some_and(|hb| hb < now - threshold)
    }

    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.error.as_ref().map(ErrorInfo::from_value)
    }
}

/// Submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub workflow_name: String,
    pub input: serde_json::Value,
    pub priority: i32,
    pub max_retries: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(workflow_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            input,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Executor request to put a task back to pending after a step asked for a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    pub delay: Duration,
    /// The step attempt that will run on the next replay.
    pub attempt: u32,
    pub error: ErrorInfo,
}

impl RetrySchedule {
    /// What lands in `tasks.error` while the retry is pending.
    pub fn error_value(&self) -> serde_json::Value {
        let mut value = self.error.to_value();
        if let Some(obj) = value.as_object_mut() {
            obj.insert("attempt".to_string(), self.attempt.into());
        }
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapAction {
    Requeued,
    Failed,
}

/// One row touched by a reaper sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapedTask {
    pub id: TaskId,
    pub workflow_name: String,
    pub retry_count: u32,
    pub action: ReapAction,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The task was already past the point where cancellation is accepted.
    Rejected(TaskStatus),
    NotFound,
}
