//! DynWorkflow - 型消去された Workflow
//!
//! # 学習ポイント
//! - Object-safe trait (DynWorkflow)
//! - Type erasure パターン (TypedWorkflow<W> → DynWorkflow)
//! - クロージャを Workflow として登録する (FnWorkflow)

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use super::codec;
use super::workflow::{Workflow, WorkflowError};
use crate::app::step_runner::WorkflowContext;
use crate::domain::ErrorInfo;

/// DynWorkflow は object-safe な Workflow の抽象化
///
/// Input and output cross this boundary as JSON, which is the shape they
/// have in the `tasks` table.
#[async_trait]
pub trait DynWorkflow: Send + Sync {
    fn name(&self) -> &str;

    async fn run_dyn(
        &self,
        ctx: WorkflowContext<serde_json::Value>,
    ) -> Result<serde_json::Value, WorkflowError>;
}

pub struct TypedWorkflow<W: Workflow> {
    workflow: W,
}

impl<W: Workflow> TypedWorkflow<W> {
    pub fn new(workflow: W) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl<W: Workflow> DynWorkflow for TypedWorkflow<W> {
    fn name(&self) -> &str {
        W::NAME
    }

    async fn run_dyn(
        &self,
        ctx: WorkflowContext<serde_json::Value>,
    ) -> Result<serde_json::Value, WorkflowError> {
        let (ctx, raw) = ctx.take_input();
        let input: W::Input = serde_json::from_value(raw).map_err(|e| {
            ErrorInfo::new(format!("workflow input decode: {e}")).with_name("InputDecodeError")
        })?;
        let output = self.workflow.run(ctx.with_input(input)).await?;
        Ok(codec::encode(&output)?)
    }
}

pub type BoxWorkflowFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, WorkflowError>> + Send>>;

/// A workflow defined by a closure over untyped JSON input.
pub struct FnWorkflow {
    name: String,
    body: Arc<dyn Fn(WorkflowContext<serde_json::Value>) -> BoxWorkflowFuture + Send + Sync>,
}

impl FnWorkflow {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(WorkflowContext<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, WorkflowError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move |ctx| -> BoxWorkflowFuture { Box::pin(body(ctx)) }),
        }
    }
}

#[async_trait]
impl DynWorkflow for FnWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_dyn(
        &self,
        ctx: WorkflowContext<serde_json::Value>,
    ) -> Result<serde_json::Value, WorkflowError> {
        (self.body)(ctx).await
    }
}
