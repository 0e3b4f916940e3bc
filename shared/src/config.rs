//! Engine configuration.
//!
//! Every section has defaults matching production behavior and can be
//! overridden from the environment:
//!
//! - `INBOX_DELIVERY_RATE_LIMIT_WINDOW_MS` / `INBOX_DELIVERY_RATE_LIMIT_MAX`
//! - `INBOX_DELIVERY_CACHE_CAPACITY` / `INBOX_DELIVERY_CACHE_TTL_MS`
//! - `INBOX_DELIVERY_DEDUP_WINDOW_MS` / `INBOX_DELIVERY_DEDUP_KEY_SCOPE` (`cross_transport` | `per_source`)
//! - `INBOX_DELIVERY_MAX_PENDING` / `INBOX_DELIVERY_CONFIRM_TIMEOUT_MS`
//! - `INBOX_DELIVERY_QUEUE_DELAY_MS` / `INBOX_DELIVERY_QUEUE_RETENTION_MS` / `INBOX_DELIVERY_QUEUE_SWEEP_INTERVAL_MS`

use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::DeliveryError;

const ENV_PREFIX: &str = "INBOX_DELIVERY_";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    /// Minimum spacing between opportunistic purges of expired buckets.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            sweep_interval_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_ms: 10 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Which fields make up the dedup key.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    /// `(conversation, prefix)`: a webhook delivery and a socket push of the
    /// same message collapse into one.
    #[default]
    CrossTransport,
    /// `(conversation, prefix, source)`: only repeats from the same transport
    /// collapse.
    PerSource,
}

impl FromStr for KeyScope {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cross_transport" | "cross-transport" => Ok(KeyScope::CrossTransport),
            "per_source" | "per-source" => Ok(KeyScope::PerSource),
            other => Err(DeliveryError::Validation(format!(
                "unknown dedup key scope: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DedupConfig {
    pub window_ms: u64,
    pub key_scope: KeyScope,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            key_scope: KeyScope::CrossTransport,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub max_pending: usize,
    /// Fail provisional messages older than this. `None` leaves failure to
    /// the send operation's own completion signal.
    pub confirm_timeout_ms: Option<u64>,
    pub confirmed_memory: usize,
    pub transition_buffer: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_pending: 100,
            confirm_timeout_ms: None,
            confirmed_memory: 1_000,
            transition_buffer: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub delay_ms: u64,
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
    pub notice_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            retention_ms: 60_000,
            sweep_interval_ms: 30_000,
            notice_buffer: 256,
        }
    }
}

impl QueueConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.notice_buffer == 0 {
            return Err(DeliveryError::Validation("queue.notice_buffer must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(DeliveryError::Validation("queue.sweep_interval_ms must be > 0".into()));
        }
        if self.retention_ms < self.delay_ms {
            return Err(DeliveryError::Validation(
                "queue.retention_ms must cover queue.delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub reconciler: ReconcilerConfig,
    pub queue: QueueConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `INBOX_DELIVERY_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        override_parsed(&mut config.rate_limit.window_ms, "RATE_LIMIT_WINDOW_MS", get("RATE_LIMIT_WINDOW_MS"));
        override_parsed(&mut config.rate_limit.max_requests, "RATE_LIMIT_MAX", get("RATE_LIMIT_MAX"));
        override_parsed(&mut config.cache.capacity, "CACHE_CAPACITY", get("CACHE_CAPACITY"));
        override_parsed(&mut config.cache.ttl_ms, "CACHE_TTL_MS", get("CACHE_TTL_MS"));
        override_parsed(&mut config.dedup.window_ms, "DEDUP_WINDOW_MS", get("DEDUP_WINDOW_MS"));
        override_parsed(&mut config.dedup.key_scope, "DEDUP_KEY_SCOPE", get("DEDUP_KEY_SCOPE"));
        override_parsed(&mut config.reconciler.max_pending, "MAX_PENDING", get("MAX_PENDING"));
        override_parsed(&mut config.queue.delay_ms, "QUEUE_DELAY_MS", get("QUEUE_DELAY_MS"));
        override_parsed(&mut config.queue.retention_ms, "QUEUE_RETENTION_MS", get("QUEUE_RETENTION_MS"));
        override_parsed(&mut config.queue.sweep_interval_ms, "QUEUE_SWEEP_INTERVAL_MS", get("QUEUE_SWEEP_INTERVAL_MS"));

        if let Some(raw) = get("CONFIRM_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.reconciler.confirm_timeout_ms = Some(ms),
                Err(e) => warn!(var = "CONFIRM_TIMEOUT_MS", error = %e, "Ignoring invalid value"),
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.rate_limit.window_ms == 0 {
            return Err(DeliveryError::Validation("rate_limit.window_ms must be > 0".into()));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(DeliveryError::Validation("rate_limit.max_requests must be > 0".into()));
        }
        if self.cache.capacity == 0 {
            return Err(DeliveryError::Validation("cache.capacity must be > 0".into()));
        }
        if self.cache.ttl_ms == 0 {
            return Err(DeliveryError::Validation("cache.ttl_ms must be > 0".into()));
        }
        if self.dedup.window_ms == 0 {
            return Err(DeliveryError::Validation("dedup.window_ms must be > 0".into()));
        }
        if self.reconciler.max_pending == 0 {
            return Err(DeliveryError::Validation("reconciler.max_pending must be > 0".into()));
        }
        if self.reconciler.transition_buffer == 0 {
            return Err(DeliveryError::Validation("reconciler.transition_buffer must be > 0".into()));
        }
        if self.rate_limit.sweep_interval_ms == 0 {
            return Err(DeliveryError::Validation("rate_limit.sweep_interval_ms must be > 0".into()));
        }
        self.queue.validate()
    }
}

fn override_parsed<T: FromStr>(slot: &mut T, name: &str, raw: Option<String>)
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else { return };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => warn!(var = name, error = %e, "Ignoring invalid value"),
    }
}
