//! CompensationRegistry - 補償処理の名前付き登録
//!
//! Steps persist only the *name* of their compensation. The rollback
//! orchestrator resolves that name here, so only compensations registered
//! in this process can run.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::domain::ErrorInfo;

pub type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), ErrorInfo>> + Send>>;

/// Receives the step's persisted output.
pub type CompensationFn = Arc<dyn Fn(serde_json::Value) -> CompensationFuture + Send + Sync>;

/// Wrap a closure as a `CompensationFn`.
///
/// ```ignore
/// let refund = compensation(|output| async move { payments::refund(output).await });
/// ```
pub fn compensation<F, Fut, E>(f: F) -> CompensationFn
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<ErrorInfo> + 'static,
{
    Arc::new(move |output| -> CompensationFuture {
        let fut = f(output);
        Box::pin(async move { fut.await.map_err(Into::into) })
    })
}

#[derive(Default)]
pub struct CompensationRegistry {
    fns: RwLock<HashMap<String, CompensationFn>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register(&self, name: impl Into<String>, f: CompensationFn) {
        let mut fns = self.fns.write().unwrap_or_else(|e| e.into_inner());
        fns.insert(name.into(), f);
    }

    pub fn get(&self, name: &str) -> Option<CompensationFn> {
        let fns = self.fns.read().unwrap_or_else(|e| e.into_inner());
        fns.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        let fns = self.fns.read().unwrap_or_else(|e| e.into_inner());
        fns.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let fns = self.fns.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = fns.keys().cloned().collect();
        names.sort();
        names
    }
}
