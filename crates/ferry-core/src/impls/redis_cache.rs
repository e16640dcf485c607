//! RedisCache - Redis 上の Cache 実装（feature = "redis"）
//!
//! `SET key value NX PX ttl` が claim の原子性を保証する。

use crate::ports::{Cache, CacheError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::info;

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Multiplexed なので clone して並行に使える
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!(url = %redis_url, "Connected to Redis cache");
        Ok(Self { conn })
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        // NX が効いた場合だけ "OK"、既存なら nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _deleted: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(60)), 60_000);
    }

    // 実 Redis が必要: FERRY_TEST_REDIS_URL=redis://127.0.0.1/ cargo test --features redis
    #[tokio::test]
    async fn claim_is_exclusive_against_real_redis() {
        let Ok(url) = std::env::var("FERRY_TEST_REDIS_URL") else {
            eprintln!("Skipping test: set FERRY_TEST_REDIS_URL to enable.");
            return;
        };
        let cache = RedisCache::connect(&url).await.unwrap();
        let key = format!("ferry:test:claim:{}", ulid::Ulid::new());

        assert!(cache.set_if_absent(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.set_if_absent(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("a"));

        cache.delete(&key).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }
}
