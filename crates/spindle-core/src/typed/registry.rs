//! WorkflowRegistry - Workflow の登録と管理
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::handler::{DynWorkflow, FnWorkflow, TypedWorkflow};
use super::workflow::{Workflow, WorkflowError};
use crate::app::step_runner::WorkflowContext;

/// WorkflowRegistry は workflow_name → DynWorkflow の対応を管理
///
/// # 使用例
/// ```ignore
/// let mut registry = WorkflowRegistry::new();
/// registry.register(Checkout)?;
///
/// let wf = registry.get("checkout");
/// ```
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn DynWorkflow>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Workflow \"{0}\" is already registered.")]
    AlreadyRegistered(String),
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self, workflow: W) -> Result<(), RegistryError> {
        self.insert(W::NAME.to_string(), Arc::new(TypedWorkflow::new(workflow)))
    }

    /// Register a closure over untyped JSON input.
    pub fn register_fn<F, Fut>(&mut self, name: &str, body: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkflowContext<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, WorkflowError>> + Send + 'static,
    {
        self.insert(name.to_string(), Arc::new(FnWorkflow::new(name, body)))
    }

    fn insert(&mut self, name: String, workflow: Arc<dyn DynWorkflow>) -> Result<(), RegistryError> {
        if self.workflows.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.workflows.insert(name, workflow);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynWorkflow>> {
        self.workflows.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }
}
