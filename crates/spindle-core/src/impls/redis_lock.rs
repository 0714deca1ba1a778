//! Redis-backed `LockStore`.
//!
//! - acquire: `SET key owner NX PX ttl`
//! - extend / release: Lua scripts that compare the value before touching
//!   the key, so a worker whose lock already expired can never renew or
//!   delete a lock now held by someone else.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::ports::{LockError, LockStore};

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { conn })
    }
}

fn backend(err: redis::RedisError) -> LockError {
    LockError::Backend(err.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(reply.is_some())
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(owner)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(updated == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(deleted == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }
}
