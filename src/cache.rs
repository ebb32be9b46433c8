//! Read-through cache for API responses.
//!
//! Responses are cached as serialized JSON under a key derived from the
//! index and every request parameter, with a fixed expiry. Redis is used
//! when `cache.url` is configured, an in-process map otherwise.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[async_trait]
pub trait ReadCache: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

/// `index::k1::v1::k2::v2`, parameters in the given order.
pub fn cache_key(index: &str, params: &[(&str, String)]) -> String {
    let mut key = index.to_string();
    for (name, value) in params {
        key.push_str("::");
        key.push_str(name);
        key.push_str("::");
        key.push_str(value);
    }
    key
}

pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid redis URL")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("Failed to connect to redis")?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl ReadCache for RedisCache {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }
}

/// In-process cache. Expired entries are dropped when read and swept on
/// every write, so the map only holds live keys plus those expired since the
/// last write.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ReadCache for MemoryCache {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > Instant::now() => {
                    return Ok(Some(value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn write(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_index_and_params() {
        let key = cache_key(
            "movies",
            &[
                ("method", "films".to_string()),
                ("page_size", "50".to_string()),
            ],
        );
        assert_eq!(key, "movies::method::films::page_size::50");
        assert_eq!(cache_key("genres", &[]), "genres");
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.read("k").await.unwrap(), None);
        cache.write("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.read("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn write_sweeps_expired_keys() {
        let cache = MemoryCache::new();
        for i in 0..1000 {
            cache
                .write(&format!("search::{}", i), "[]", Duration::ZERO)
                .await
                .unwrap();
        }
        cache.write("live", "v", Duration::from_secs(60)).await.unwrap();

        let entries = cache.entries.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("live"));
    }

    #[tokio::test]
    async fn memory_cache_expires() {
        let cache = MemoryCache::new();
        cache.write("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(cache.read("k").await.unwrap(), None);
        assert!(cache.is_empty().await);
    }
}
