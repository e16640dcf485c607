//! Cache port - best-effort, TTL-bound key/value storage.
//!
//! Nothing stored here is authoritative. Every caller must tolerate a miss
//! and every error.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Atomically store `value` under `key` unless the key exists.
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}
