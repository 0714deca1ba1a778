//! Step: a named, memoized unit of side-effecting work inside a task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{StepId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for its next attempt (after a retry was scheduled).
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "completed" => StepStatus::Completed,
            "failed" => StepStatus::Failed,
            other => return Err(format!("unknown step status: {other}")),
        })
    }
}

/// A row of the `steps` table.
///
/// Unique on `(task_id, step_key)`: replays reuse the row and bump `attempt`.
/// `compensation_fn` is a registry key, never a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub task_id: TaskId,
    pub step_key: String,
    pub status: StepStatus,
    /// 1-based.
    pub attempt: u32,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub compensation_fn: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Completed with a compensation reference and not yet undone.
    pub fn needs_compensation(&self) -> bool {
        self.is_completed() && self.compensation_fn.is_some() && self.compensated_at.is_none()
    }
}
