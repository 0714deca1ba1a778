//! Domain model (ids, task, step, dead letter, errors).
//!
//! This layer knows nothing about queues, runtimes or databases; it only
//! defines the shape of the rows the engine reads and writes.

pub mod dead_letter;
pub mod errors;
pub mod ids;
pub mod step;
pub mod task;

pub use self::dead_letter::DeadLetterEntry;
pub use self::errors::{ErrorInfo, StoreError};
pub use self::ids::{DeadLetterId, StepId, TaskId, WorkerId};
pub use self::step::{Step, StepStatus};
pub use self::task::{
    CancelOutcome, NewTask, ReapAction, ReapedTask, RetrySchedule, Task, TaskStatus,
    DEFAULT_MAX_RETRIES,
};
