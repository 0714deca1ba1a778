//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder / Engine**: 構築・ワイヤリングと投入 API
//! - **Poller**: タスクの取得と配送（claim→dispatch）
//! - **WorkflowExecutor / StepRunner**: ハンドラ実行と step の memoization
//! - **ExecutionPool / bridge**: ハンドラ専用ランタイムとストアへの要求チャネル
//! - **HeartbeatService / ReaperLoop / LeaderElector**: クラッシュ検知と回収
//! - **RollbackOrchestrator**: 補償処理 (Saga)

pub mod backoff;
pub mod backpressure;
pub mod bridge;
pub mod builder;
pub mod config;
pub mod engine;
pub mod executor;
pub mod heartbeat;
pub mod leader;
pub mod poller;
pub mod pool;
pub mod reaper_loop;
pub mod rollback;
pub mod step_runner;

// 主要な型を再エクスポート
pub use self::backoff::BackoffPolicy;
pub use self::backpressure::{Backpressure, LagMonitor};
pub use self::bridge::{BridgeError, StepBroker, StepClient};
pub use self::builder::{BuildError, EngineBuilder};
pub use self::config::{
    BackpressureConfig, ConfigError, EngineConfig, PollerConfig, PoolConfig, ReaperConfig,
};
pub use self::engine::{CancelError, Engine};
pub use self::executor::{ExecutionOutcome, ExecutorError, TaskRunner, WorkflowExecutor};
pub use self::heartbeat::HeartbeatService;
pub use self::leader::{LeaderElector, REAPER_LEADER_KEY};
pub use self::poller::{Dispatcher, PollInterval, Poller};
pub use self::pool::{ExecutionPool, PoolError};
pub use self::reaper_loop::{ReapReport, ReaperLoop};
pub use self::rollback::{RollbackError, RollbackOrchestrator, RollbackResult};
pub use self::step_runner::{StepOptions, StepRunner, WorkflowContext};
