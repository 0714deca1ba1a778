//! Errors - 永続化されるエラー形とストア層のエラー
//!
//! `ErrorInfo` is what users see: it is written to `tasks.error`,
//! `steps.error` and `dead_letters.error` as JSON. `StoreError` is the
//! failure type of every storage port.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured failure: `{message, name, stack?, code?}`.
///
/// Any `std::error::Error` converts into it, so step closures can use `?`
/// on their own error types. `ErrorInfo` intentionally does not implement
/// `std::error::Error` itself (that would make the blanket `From` overlap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: "Error".to_string(),
            stack: None,
            code: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The error the reaper writes when a crashed task has no retries left.
    pub fn max_retries_exceeded() -> Self {
        Self::new("Task exceeded max retries after worker failure")
            .with_name("MaxRetriesExceeded")
            .with_code("MAX_RETRIES_EXCEEDED")
    }

    pub fn to_value(&self) -> serde_json::Value {
        // A struct of strings always serializes.
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "message": self.message }))
    }

    /// Lenient read-back: accepts anything with at least a `message`.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            Self::new(message)
        })
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E> From<E> for ErrorInfo
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();
        let mut info = ErrorInfo::new(err.to_string()).with_name(name);
        if let Some(source) = err.source() {
            info.stack = Some(format!("caused by: {source}"));
        }
        info
    }
}

/// Storage port failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation that the caller did not expect.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection drop, pool closed, lock contention, ...
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("row decode failed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn database(operation: &str, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}
