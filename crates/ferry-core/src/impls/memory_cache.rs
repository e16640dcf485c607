//! InMemoryCache - TTL 付きの開発用キャッシュ
//!
//! 期限は `tokio::time::Instant` で測るので、`start_paused` なテストでは
//! `tokio::time::advance` で期限切れを再現できる。
//!
//! 期限切れエントリは書き込みのたびに掃除する。claim キーは二度と読まれないので、
//! 読み出し時の削除だけではマップが配送数だけ伸び続ける。

use crate::ports::{Cache, CacheError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: while unavailable, every operation fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Whether `key` holds a live entry. Ignores availability.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|e| e.get(key).is_some_and(|entry| entry.is_live(now)))
            .unwrap_or(false)
    }

    /// Stored entries, expired ones included until the next write.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache switched off".into()));
        }
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }
}

fn prune(entries: &mut HashMap<String, Entry>, now: Instant) {
    entries.retain(|_, entry| entry.is_live(now));
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        prune(&mut entries, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        prune(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
