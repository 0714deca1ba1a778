//! IdGenerator port - ID 生成の抽象化
//!
//! Row ids are generated on the client side (not by the database) so the
//! in-memory and Postgres stores hand out the same kind of identifier.

use crate::domain::ids::{DeadLetterId, StepId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_step_id(&self) -> StepId;

    fn generate_dead_letter_id(&self) -> DeadLetterId;
}

/// ULID ids whose timestamp part comes from the injected clock.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_step_id(&self) -> StepId {
        StepId::from(self.next())
    }

    fn generate_dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId::from(self.next())
    }
}
