//! Workflow trait - 型付き Workflow の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types で入力・出力の型を Workflow ごとに固定

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::app::step_runner::WorkflowContext;
use crate::domain::ErrorInfo;

/// Workflow は workflow_name と処理本体を対応付ける
///
/// # 使用例
/// ```ignore
/// struct Checkout;
///
/// #[async_trait]
/// impl Workflow for Checkout {
///     const NAME: &'static str = "checkout";
///     type Input = Order;
///     type Output = Receipt;
///
///     async fn run(&self, ctx: WorkflowContext<Order>) -> Result<Receipt, WorkflowError> {
///         let charge = ctx.step.run("charge", || charge(&ctx.input), StepOptions::new()).await?;
///         Ok(Receipt { charge })
///     }
/// }
/// ```
///
/// The body is replayed from the top after every crash or step retry;
/// side effects belong inside `ctx.step.run` so they are memoized.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Value stored in `tasks.workflow_name`.
    const NAME: &'static str;

    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn run(&self, ctx: WorkflowContext<Self::Input>) -> Result<Self::Output, WorkflowError>;
}

/// Signal raised by a step that failed but still has retries left.
///
/// It unwinds the whole workflow body; the executor turns it into a
/// delayed re-queue of the task.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRetry {
    pub step: String,
    pub delay: Duration,
    /// The attempt number the step will run with on replay.
    pub attempt: u32,
    pub error: ErrorInfo,
}

/// Error returned from workflow bodies and `step.run`.
///
/// Any `std::error::Error` converts into `Failed`, so `?` works on
/// ordinary errors inside a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowError {
    Retry(StepRetry),
    Failed(ErrorInfo),
}

impl WorkflowError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkflowError::Failed(ErrorInfo::new(message))
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, WorkflowError::Retry(_))
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Retry(retry) => write!(
                f,
                "step {:?} retry scheduled in {}ms (attempt {}): {}",
                retry.step,
                retry.delay.as_millis(),
                retry.attempt,
                retry.error
            ),
            WorkflowError::Failed(info) => info.fmt(f),
        }
    }
}

impl From<ErrorInfo> for WorkflowError {
    fn from(info: ErrorInfo) -> Self {
        WorkflowError::Failed(info)
    }
}

impl<E> From<E> for WorkflowError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        WorkflowError::Failed(ErrorInfo::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("inventory empty")]
    struct OutOfStock;

    fn reserve() -> Result<(), WorkflowError> {
        Err(OutOfStock)?;
        Ok(())
    }

    #[test]
    fn question_mark_converts_std_errors() {
        let err = reserve().unwrap_err();
        assert!(!err.is_retry());
        assert_eq!(err.to_string(), "OutOfStock: inventory empty");
    }
}
