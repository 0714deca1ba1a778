//! StepRunner - `ctx.step.run` の実装
//!
//! # 学習ポイント
//! - 完了済み step は関数を呼ばずにキャッシュを返す (memoization)
//! - 失敗時は retries が残っていれば WorkflowError::Retry でタスク全体を中断
//! - 補償関数は名前だけが永続化される

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::bridge::StepClient;
use crate::domain::{ErrorInfo, TaskId};
use crate::typed::{codec, compensation, CompensationFn, CompensationRegistry, StepRetry, WorkflowError};

/// What a workflow body receives.
pub struct WorkflowContext<I> {
    pub run_id: TaskId,
    pub workflow_name: String,
    pub input: I,
    pub step: StepRunner,
}

impl<I> WorkflowContext<I> {
    pub fn new(run_id: TaskId, workflow_name: impl Into<String>, input: I, step: StepRunner) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            input,
            step,
        }
    }

    pub fn take_input(self) -> (WorkflowContext<()>, I) {
        let WorkflowContext {
            run_id,
            workflow_name,
            input,
            step,
        } = self;
        (
            WorkflowContext {
                run_id,
                workflow_name,
                input: (),
                step,
            },
            input,
        )
    }

    pub fn with_input<J>(self, input: J) -> WorkflowContext<J> {
        WorkflowContext {
            run_id: self.run_id,
            workflow_name: self.workflow_name,
            input,
            step: self.step,
        }
    }
}

/// Per-step options.
///
/// ```ignore
/// StepOptions::new()
///     .retries(3)
///     .timeout(Duration::from_secs(10))
///     .compensate_with(|charge| async move { refund(charge).await })
/// ```
#[derive(Clone, Default)]
pub struct StepOptions {
    retries: u32,
    timeout: Option<Duration>,
    compensation: Option<CompensationFn>,
    compensation_name: Option<String>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries after the first attempt. Default 0.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Undo action run by rollback with this step's output.
    pub fn compensate_with<F, Fut, E>(mut self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<ErrorInfo> + 'static,
    {
        self.compensation = Some(compensation(f));
        self
    }

    /// Registry key for the compensation, `"{workflow}:{step}"` by default.
    ///
    /// Without `compensate_with` the name must already be registered.
    pub fn compensation_name(mut self, name: impl Into<String>) -> Self {
        self.compensation_name = Some(name.into());
        self
    }
}

impl std::fmt::Debug for StepOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepOptions")
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("compensation", &self.compensation.is_some())
            .field("compensation_name", &self.compensation_name)
            .finish()
    }
}

#[derive(Clone)]
pub struct StepRunner {
    workflow_name: String,
    client: StepClient,
    compensations: Arc<CompensationRegistry>,
    backoff: BackoffPolicy,
}

impl StepRunner {
    pub fn new(
        workflow_name: impl Into<String>,
        client: StepClient,
        compensations: Arc<CompensationRegistry>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            client,
            compensations,
            backoff,
        }
    }

    /// Run `f` once per task, memoized under `name`.
    ///
    /// A completed step returns its stored output without calling `f`.
    pub async fn run<T, F, Fut, E>(
        &self,
        name: &str,
        f: F,
        options: StepOptions,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: Into<ErrorInfo> + Send,
    {
        if let Some(step) = self.client.find(name).await? {
            if step.is_completed() {
                debug!(step = name, "replaying memoized step");
                return Ok(codec::decode(step.output)?);
            }
        }

        let step = self.client.create_or_find(name, None).await?;
        if step.is_completed() {
            return Ok(codec::decode(step.output)?);
        }

        let outcome: Result<T, ErrorInfo> = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(ErrorInfo::new(format!(
                    "Step \"{name}\" timed out after {}ms",
                    limit.as_millis()
                ))
                .with_name("StepTimeoutError")
                .with_code("STEP_TIMEOUT")),
            },
            None => f().await.map_err(Into::into),
        };

        match outcome {
            Ok(value) => {
                let output = codec::encode(&value)?;
                let compensation_fn = self.register_compensation(name, options);
                self.client.complete(step.id, output, compensation_fn).await?;
                Ok(value)
            }
            Err(error) if step.attempt <= options.retries => {
                let delay = self.backoff.delay(step.attempt);
                self.client.increment_attempt(step.id).await?;
                warn!(
                    step = name,
                    attempt = step.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "step failed, retry scheduled"
                );
                Err(WorkflowError::Retry(StepRetry {
                    step: name.to_string(),
                    delay,
                    attempt: step.attempt + 1,
                    error,
                }))
            }
            Err(error) => {
                self.client.fail(step.id, error.clone()).await?;
                warn!(step = name, attempt = step.attempt, error = %error, "step failed");
                Err(WorkflowError::Failed(error))
            }
        }
    }

    fn register_compensation(&self, step: &str, options: StepOptions) -> Option<String> {
        let StepOptions {
            compensation,
            compensation_name,
            ..
        } = options;
        match (compensation, compensation_name) {
            (Some(f), name) => {
                let key = name.unwrap_or_else(|| format!("{}:{}", self.workflow_name, step));
                self.compensations.register(key.clone(), f);
                Some(key)
            }
            (None, Some(name)) => Some(name),
            (None, None) => None,
        }
    }
}
