//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryStore**: 開発用・テスト用の TaskStore / StepStore / DeadLetterStore
//! - **InMemoryLockStore**: 単一プロセス用の LockStore
//! - **PgStore**: Postgres (本番の正本)
//! - **RedisLockStore**: Redis の TTL ロック (feature `redis`)

pub mod memory;
pub mod memory_lock;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_lock;

pub use self::memory::InMemoryStore;
pub use self::memory_lock::InMemoryLockStore;
pub use self::postgres::PgStore;
#[cfg(feature = "redis")]
pub use self::redis_lock::RedisLockStore;
