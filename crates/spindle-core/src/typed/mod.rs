//! Typed - 型付き Workflow API
//!
//! workflow_name の typo を型で排除し、入力・出力の型を Workflow ごとに
//! 静的に固定します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Workflow` trait - 型安全
//! - **内部（Dyn）**: `DynWorkflow` trait - object-safe, JSON in / JSON out

pub mod codec;
pub mod compensation;
pub mod handler;
pub mod registry;
pub mod workflow;

pub use self::codec::{CodecError, MAX_PAYLOAD_BYTES};
pub use self::compensation::{compensation, CompensationFn, CompensationRegistry};
pub use self::handler::{DynWorkflow, FnWorkflow, TypedWorkflow};
pub use self::registry::{RegistryError, WorkflowRegistry};
pub use self::workflow::{StepRetry, Workflow, WorkflowError};
