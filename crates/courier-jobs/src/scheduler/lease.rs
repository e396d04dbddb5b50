//! Per-task execution leases.
//!
//! A lease is held under a random owner token and expires after its TTL, so
//! a crashed holder never blocks a task for longer than one TTL. Release only
//! deletes the lease if the token still matches.

use crate::error::JobResult;
use async_trait::async_trait;
use deadpool_redis::Pool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Owner token of an acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Mutual exclusion across scheduler processes.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Takes the lease on `key` unless another owner holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> JobResult<Option<LeaseToken>>;

    /// Gives the lease back. Returns false if it had already expired or
    /// changed hands.
    async fn release(&self, key: &str, token: &LeaseToken) -> JobResult<bool>;
}

/// Redis lease: `SET NX PX` to acquire, compare-and-delete to release.
pub struct RedisLeaseLock {
    pool: Pool,
    prefix: String,
}

impl RedisLeaseLock {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:lease:{key}", self.prefix)
    }
}

#[async_trait]
impl LeaseLock for RedisLeaseLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> JobResult<Option<LeaseToken>> {
        let mut conn = self.pool.get().await?;
        let token = LeaseToken::generate();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let result: Option<String> = ::redis::cmd("SET")
            .arg(self.key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut *conn)
            .await?;

        if result.is_some() {
            debug!(lease = %key, "Acquired lease");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i32 = ::redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(key))
            .arg(token.as_str())
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// In-process lease table.
#[derive(Debug, Default)]
pub struct MemoryLeaseLock {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> JobResult<Option<LeaseToken>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = LeaseToken::generate();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> JobResult<bool> {
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some((held, _)) if held == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lease_exclusion() {
        let lock = MemoryLeaseLock::new();
        let token = lock.acquire("job-1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(lock.acquire("job-1", Duration::from_secs(60)).await.unwrap().is_none());
        assert!(lock.acquire("job-2", Duration::from_secs(60)).await.unwrap().is_some());

        let stranger = LeaseToken::generate();
        assert!(!lock.release("job-1", &stranger).await.unwrap());
        assert!(lock.release("job-1", &token).await.unwrap());
        assert!(lock.acquire("job-1", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_lease_expires() {
        let lock = MemoryLeaseLock::new();
        let first = lock.acquire("job", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = lock.acquire("job", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_ne!(first, second);
        assert!(!lock.release("job", &first).await.unwrap());
    }
}
