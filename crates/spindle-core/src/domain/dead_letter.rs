use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DeadLetterId, StepId, TaskId};

/// A compensation that could not be run; an operator has to finish it by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub step_id: StepId,
    pub error: serde_json::Value,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}
