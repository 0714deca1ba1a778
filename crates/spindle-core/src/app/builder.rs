//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::backpressure::{Backpressure, LagMonitor};
use super::config::{ConfigError, EngineConfig};
use super::engine::Engine;
use super::executor::{TaskRunner, WorkflowExecutor};
use super::heartbeat::HeartbeatService;
use super::leader::LeaderElector;
use super::poller::Poller;
use super::pool::{ExecutionPool, PoolError};
use super::reaper_loop::ReaperLoop;
use super::rollback::RollbackOrchestrator;
use super::step_runner::WorkflowContext;
use crate::domain::WorkerId;
use crate::impls::{InMemoryLockStore, InMemoryStore};
use crate::ports::{DeadLetterStore, LockStore, StepStore, TaskStore};
use crate::typed::{
    CompensationFn, CompensationRegistry, RegistryError, Workflow, WorkflowError, WorkflowRegistry,
};

const LAG_RESOLUTION: Duration = Duration::from_millis(20);

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .with_store(Arc::new(PgStore::connect(&url, 10).await?))
///     .register(Checkout)?
///     .expect_workflows(&["checkout"])
///     .build()?;
/// engine.start().await?;
/// ```
///
/// # Fail-fast 設計
/// - expect_workflows() で期待される workflow 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
///
/// Without `with_store` / `with_lock_store` the engine runs on in-memory
/// stores, which is only useful for a single process.
pub struct EngineBuilder {
    config: EngineConfig,
    tasks: Option<Arc<dyn TaskStore>>,
    steps: Option<Arc<dyn StepStore>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    locks: Option<Arc<dyn LockStore>>,
    workflows: WorkflowRegistry,
    compensations: CompensationRegistry,
    expected_workflows: Option<Vec<String>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing workflows: {0:?}. These workflows were expected but not registered.")]
    MissingWorkflows(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            tasks: None,
            steps: None,
            dead_letters: None,
            locks: None,
            workflows: WorkflowRegistry::new(),
            compensations: CompensationRegistry::new(),
            expected_workflows: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// One backend for tasks, steps and dead letters.
    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TaskStore + StepStore + DeadLetterStore + 'static,
    {
        self.tasks = Some(store.clone());
        self.steps = Some(store.clone());
        self.dead_letters = Some(store);
        self
    }

    pub fn with_lock_store(mut self, locks: Arc<dyn LockStore>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Workflow を登録
    pub fn register<W: Workflow>(mut self, workflow: W) -> Result<Self, RegistryError> {
        self.workflows.register(workflow)?;
        Ok(self)
    }

    pub fn register_fn<F, Fut>(mut self, name: &str, body: F) -> Result<Self, RegistryError>
    where
        F: Fn(WorkflowContext<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, WorkflowError>> + Send + 'static,
    {
        self.workflows.register_fn(name, body)?;
        Ok(self)
    }

    /// Pre-register a compensation so steps can refer to it by name.
    pub fn register_compensation(self, name: impl Into<String>, f: CompensationFn) -> Self {
        self.compensations.register(name, f);
        self
    }

    /// 期待される workflow 名のリストを設定
    pub fn expect_workflows(mut self, names: &[&str]) -> Self {
        self.expected_workflows = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Wire every component. Nothing runs until `Engine::start`.
    ///
    /// # 検証
    /// - expect_workflows() で設定された名前が全て登録されているかチェック
    pub fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected) = &self.expected_workflows {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.workflows.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingWorkflows(missing));
            }
        }

        let config = self.config;
        config.validate()?;
        let worker_id = config
            .worker_id
            .clone()
            .map(WorkerId::new)
            .unwrap_or_else(WorkerId::generate);

        let (tasks, steps, dead_letters) = match (self.tasks, self.steps, self.dead_letters) {
            (Some(t), Some(s), Some(d)) => (t, s, d),
            _ => {
                let memory = Arc::new(InMemoryStore::new());
                let tasks: Arc<dyn TaskStore> = memory.clone();
                let steps: Arc<dyn StepStore> = memory.clone();
                let dead_letters: Arc<dyn DeadLetterStore> = memory;
                (tasks, steps, dead_letters)
            }
        };
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(InMemoryLockStore::new()));

        let workflows = Arc::new(self.workflows);
        let compensations = Arc::new(self.compensations);
        let pool = Arc::new(ExecutionPool::new(&config.pool)?);
        let heartbeat = Arc::new(HeartbeatService::new(
            tasks.clone(),
            config.heartbeat_interval.0,
            worker_id.clone(),
        ));
        let lag = Arc::new(LagMonitor::new(LAG_RESOLUTION));

        let executor = Arc::new(WorkflowExecutor::new(
            tasks.clone(),
            steps.clone(),
            workflows.clone(),
            compensations.clone(),
            pool.clone(),
            config.backoff.clone(),
            config.bridge_timeout.0,
            worker_id.clone(),
        ));

        // claims stop no later than the point where the pool starts rejecting
        let mut limits = config.backpressure.clone();
        limits.max_queue_depth = limits.max_queue_depth.min(config.pool.max_queue);
        let backpressure = {
            let pool = pool.clone();
            Arc::new(Backpressure::new(limits, lag.clone(), move || pool.queued()))
        };
        let poller = Poller::new(
            tasks.clone(),
            Arc::new(TaskRunner::new(executor.clone(), heartbeat.clone())),
            config.poller.clone(),
            worker_id.clone(),
        )
        .with_backpressure(Arc::new(move || backpressure.is_overloaded()));

        let elector = Arc::new(LeaderElector::new(
            locks,
            worker_id.as_str(),
            config.reaper.leader_ttl,
        ));
        let reaper = ReaperLoop::new(tasks.clone(), elector, config.reaper.clone());

        let rollback = RollbackOrchestrator::new(
            tasks.clone(),
            steps.clone(),
            dead_letters.clone(),
            compensations.clone(),
        );

        Ok(Engine::new(super::engine::Parts {
            worker_id,
            config,
            tasks,
            steps,
            dead_letters,
            workflows,
            compensations,
            pool,
            heartbeat,
            lag,
            executor,
            poller,
            reaper,
            rollback,
        }))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(ctx: WorkflowContext<serde_json::Value>) -> impl Future<Output = Result<serde_json::Value, WorkflowError>> {
        async move { Ok(ctx.input) }
    }

    #[tokio::test]
    async fn test_build_success() {
        let engine = EngineBuilder::new()
            .register_fn("echo", echo)
            .unwrap()
            .expect_workflows(&["echo"])
            .build();
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn test_build_missing_workflows() {
        let engine = EngineBuilder::new()
            .register_fn("echo", echo)
            .unwrap()
            .expect_workflows(&["echo", "checkout"])
            .build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingWorkflows(missing)) if missing == vec!["checkout".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_build_no_expect_workflows() {
        let engine = EngineBuilder::new().register_fn("echo", echo).unwrap().build().unwrap();
        assert_eq!(engine.workflows().list(), vec!["echo"]);
        assert_eq!(engine.status(crate::domain::TaskId::generate()).await.unwrap(), None);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let result = EngineBuilder::new()
            .register_fn("echo", echo)
            .unwrap()
            .register_fn("echo", echo);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn configured_worker_id_is_used() {
        let config = EngineConfig {
            worker_id: Some("worker-fixed".into()),
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new().with_config(config).build().unwrap();
        assert_eq!(engine.worker_id().as_str(), "worker-fixed");
    }
}
