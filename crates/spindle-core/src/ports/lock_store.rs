//! LockStore port - TTL locks for leader election.
//!
//! Every operation is a single atomic server-side step; there is no
//! read-modify-write on the client.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key = owner` with `ttl` only if the key does not exist.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Reset the TTL only if `key` is still held by `owner`.
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it is still held by `owner`.
    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError>;

    /// Current holder, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;
}
