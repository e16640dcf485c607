//! Configuration for the task engine.
//!
//! Defaults match the production deployment: three retries two seconds
//! apart, a thirty minute record cache and a one minute claim window.
//! `FerryConfig::from_env` overlays `FERRY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackoffKind::Constant => "constant",
            BackoffKind::Exponential => "exponential",
        })
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(BackoffKind::Constant),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown backoff {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-dispatches allowed after the first attempt (env: FERRY_MAX_ATTEMPTS)
    pub max_attempts: u32,
    /// Base delay before a re-dispatch (env: FERRY_RETRY_DELAY_MS)
    pub delay_ms: u64,
    /// env: FERRY_RETRY_BACKOFF = constant | exponential
    pub backoff: BackoffKind,
    /// Exponential growth factor (env: FERRY_RETRY_MULTIPLIER)
    pub multiplier: f64,
    /// Exponential cap (env: FERRY_RETRY_MAX_DELAY_MS)
    pub max_delay_ms: u64,
    /// Full jitter (env: FERRY_RETRY_JITTER)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 2_000,
            backoff: BackoffKind::Constant,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of the record and status entries (env: FERRY_CACHE_TTL_SECS)
    pub record_ttl_secs: u64,
    /// Claim window (env: FERRY_CLAIM_TTL_SECS)
    pub claim_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 30 * 60,
            claim_ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer loops (env: FERRY_WORKER_CONCURRENCY)
    pub concurrency: usize,
    /// Deliveries processed at once across all loops (env: FERRY_MAX_IN_FLIGHT)
    pub max_in_flight: usize,
    /// env: FERRY_QUEUE
    pub queue: String,
    /// env: FERRY_POLL_TIMEOUT_MS
    pub poll_timeout_ms: u64,
    /// Pause before a delivery is handed back after a store failure
    /// (env: FERRY_REQUEUE_DELAY_MS)
    pub requeue_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_in_flight: 32,
            queue: "task_queue".to_string(),
            poll_timeout_ms: 1_000,
            requeue_delay_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// env: FERRY_REAPER_ENABLED
    pub enabled: bool,
    /// Pending or running records untouched for this long are re-published
    /// (env: FERRY_REAPER_STALE_AFTER_SECS)
    pub stale_after_secs: u64,
    /// env: FERRY_REAPER_INTERVAL_SECS
    pub interval_secs: u64,
    /// env: FERRY_REAPER_BATCH_SIZE
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_secs: 5 * 60,
            interval_secs: 60,
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FerryConfig {
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
    pub reaper: ReaperConfig,
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

impl FerryConfig {
    /// Defaults overlaid with `FERRY_*` environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut c = Self::default();

        parse(&lookup, "FERRY_MAX_ATTEMPTS", &mut c.retry.max_attempts)?;
        parse(&lookup, "FERRY_RETRY_DELAY_MS", &mut c.retry.delay_ms)?;
        parse(&lookup, "FERRY_RETRY_BACKOFF", &mut c.retry.backoff)?;
        parse(&lookup, "FERRY_RETRY_MULTIPLIER", &mut c.retry.multiplier)?;
        parse(&lookup, "FERRY_RETRY_MAX_DELAY_MS", &mut c.retry.max_delay_ms)?;
        parse(&lookup, "FERRY_RETRY_JITTER", &mut c.retry.jitter)?;

        parse(&lookup, "FERRY_CACHE_TTL_SECS", &mut c.cache.record_ttl_secs)?;
        parse(&lookup, "FERRY_CLAIM_TTL_SECS", &mut c.cache.claim_ttl_secs)?;

        parse(&lookup, "FERRY_WORKER_CONCURRENCY", &mut c.worker.concurrency)?;
        parse(&lookup, "FERRY_MAX_IN_FLIGHT", &mut c.worker.max_in_flight)?;
        parse(&lookup, "FERRY_QUEUE", &mut c.worker.queue)?;
        parse(&lookup, "FERRY_POLL_TIMEOUT_MS", &mut c.worker.poll_timeout_ms)?;
        parse(&lookup, "FERRY_REQUEUE_DELAY_MS", &mut c.worker.requeue_delay_ms)?;

        parse(&lookup, "FERRY_REAPER_ENABLED", &mut c.reaper.enabled)?;
        parse(&lookup, "FERRY_REAPER_STALE_AFTER_SECS", &mut c.reaper.stale_after_secs)?;
        parse(&lookup, "FERRY_REAPER_INTERVAL_SECS", &mut c.reaper.interval_secs)?;
        parse(&lookup, "FERRY_REAPER_BATCH_SIZE", &mut c.reaper.batch_size)?;

        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Inconsistent(msg.to_string()));

        if self.cache.claim_ttl_secs == 0 {
            return fail("claim TTL must be positive");
        }
        if self.cache.record_ttl_secs == 0 {
            return fail("record cache TTL must be positive");
        }
        if self.worker.concurrency == 0 || self.worker.max_in_flight == 0 {
            return fail("worker concurrency and max in-flight must be positive");
        }
        if self.worker.queue.trim().is_empty() {
            return fail("queue name must not be empty");
        }
        if self.worker.poll_timeout_ms == 0 {
            return fail("poll timeout must be positive");
        }
        if self.retry.backoff == BackoffKind::Exponential
            && !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0)
        {
            return fail("exponential multiplier must be a finite number >= 1");
        }
        if self.reaper.enabled {
            if self.reaper.interval_secs == 0 || self.reaper.batch_size == 0 {
                return fail("reaper interval and batch size must be positive");
            }
            // 遅延中の retry を reaper が拾わないように
            let longest_delay = self.retry.delay_ms.max(self.retry.max_delay_ms) / 1_000;
            if self.reaper.stale_after_secs <= self.cache.claim_ttl_secs.max(longest_delay) {
                return fail("reaper stale threshold must exceed the claim TTL and the longest retry delay");
            }
        }
        Ok(())
    }
}
