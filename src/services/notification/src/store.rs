//! Shared counter/key-value store
//!
//! A single process keeps everything in [`MemoryKvStore`]. Several engine
//! instances that must agree on counters share a [`RedisKvStore`].

use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client as RedisClient};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Increment the integer at `key`, creating it at 0 first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Attach a TTL to an existing key. No-op when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process store. Expired keys are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                value: "0".to_string(),
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }

        let current: i64 = entry.value.parse().map_err(|_| {
            NotificationError::store(format!("value at '{}' is not an integer", key))
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed store. All keys are namespaced with `key_prefix`.
#[derive(Clone)]
pub struct RedisKvStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisKvStore {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis shared store");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let value = redis::cmd("INCR")
            .arg(self.key(key))
            .query_async::<_, i64>(&mut self.connection.clone())
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<_, Option<String>>(&mut self.connection.clone())
            .await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        redis::cmd("EXPIRE")
            .arg(self.key(key))
            .arg(ttl.as_secs().max(1))
            .query_async::<_, i64>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.connection.clone())
            .await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_creates_and_counts() {
        let store = MemoryKvStore::new();
        assert_eq!(store.incr("hits").await.unwrap(), 1);
        assert_eq!(store.incr("hits").await.unwrap(), 2);
        assert_eq!(store.get("hits").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryKvStore::new();
        store
            .set_with_expiry("name", "ana", Duration::from_secs(60))
            .await
            .unwrap();
        let err = store.incr("name").await.unwrap_err();
        assert!(matches!(err, NotificationError::Store { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = MemoryKvStore::new();
        store
            .set_with_expiry("token", "abc", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.get("token").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("token").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_counter_restarts() {
        let store = MemoryKvStore::new();
        store.incr("bucket").await.unwrap();
        store.incr("bucket").await.unwrap();
        store
            .expire("bucket", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.incr("bucket").await.unwrap(), 1);
    }
}
