//! Per-plugin token-bucket rate limiter for outbound requests.
//!
//! Each plugin gets an independent bucket with a configurable burst and
//! continuous refill. An empty bucket fails the request immediately; nothing
//! is queued.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum burst size (tokens in the bucket).
    pub burst: u32,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 60,
            refill_per_sec: 10.0,
        }
    }
}

impl From<&vcp_config::NetworkConfig> for RateLimitConfig {
    fn from(config: &vcp_config::NetworkConfig) -> Self {
        Self {
            burst: config.rate_limit_burst,
            refill_per_sec: config.rate_limit_refill_per_sec,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    /// Refill tokens based on elapsed time, then try to consume one.
    fn try_consume(&mut self, burst: u32, refill_per_sec: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(burst as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available.
    fn retry_after(&self, refill_per_sec: f64) -> Duration {
        if refill_per_sec <= 0.0 {
            return Duration::from_secs(60);
        }
        let needed = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(needed / refill_per_sec)
    }
}

/// Shared limiter state, keyed by plugin id.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, Bucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token for `plugin_id`. `Err` carries how long until a token
    /// will be available.
    pub fn check(&self, plugin_id: &str) -> Result<(), Duration> {
        let mut entry = self
            .buckets
            .entry(plugin_id.to_string())
            .or_insert_with(|| Bucket::new(self.config.burst));
        if entry.try_consume(self.config.burst, self.config.refill_per_sec) {
            Ok(())
        } else {
            Err(entry.retry_after(self.config.refill_per_sec))
        }
    }

    /// Forget a plugin's bucket (used on uninstall).
    pub fn reset(&self, plugin_id: &str) -> bool {
        self.buckets.remove(plugin_id).is_some()
    }

    /// Evict buckets idle for longer than `idle`.
    pub fn cleanup(&self, idle: Duration) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < idle);
        before - self.buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
