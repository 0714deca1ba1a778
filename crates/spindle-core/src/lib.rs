//! spindle-core
//!
//! Durable workflow execution on Postgres.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, step, dead_letter, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, StepStore, DeadLetterStore, LockStore, Clock）
//! - **impls**: 実装（Postgres, Redis, 開発・テスト用の in-memory）
//! - **typed**: 型付き Workflow API（Workflow trait, WorkflowRegistry, CompensationRegistry, codec）
//! - **app**: アプリケーションロジック（engine, poller, executor, reaper, rollback, など）
//!
//! ```ignore
//! let engine = EngineBuilder::new()
//!     .with_config(EngineConfig::from_env()?)
//!     .register(HelloWorld)?
//!     .build()?;
//! engine.start().await?;
//! let id = engine.submit("hello-world", json!({ "name": "Ada" })).await?;
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{Engine, EngineBuilder, EngineConfig, StepOptions, WorkflowContext};
pub use crate::domain::{ErrorInfo, NewTask, Task, TaskId, TaskStatus};
pub use crate::typed::{Workflow, WorkflowError};
