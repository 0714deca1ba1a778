//! Ports - 抽象化レイヤー
//!
//! Each trait is the seam to an external system (Postgres, Redis) so the
//! engine can be wired to the real backends in production and to the
//! in-memory implementations in tests.
//!
//! - Postgres is the source of truth for tasks, steps and dead letters.
//! - Redis only holds the leader lock.

pub mod clock;
pub mod dead_letter_store;
pub mod id_generator;
pub mod lock_store;
pub mod step_store;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dead_letter_store::DeadLetterStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lock_store::{LockError, LockStore};
pub use self::step_store::StepStore;
pub use self::task_store::TaskStore;
