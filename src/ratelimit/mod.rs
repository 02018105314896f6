//! Per-key sliding-window rate limiting with a circuit breaker.
//!
//! Three windows (second / minute / hour) are counted over one shared
//! timestamp deque per key. Consecutive failures past the breaker
//! threshold open the circuit until the cool-down elapses.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited,
    CircuitOpen,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_hour: u32,
    pub burst: u32,
    pub breaker_threshold: u32,
    pub breaker_timeout_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 100,
            per_hour: 1000,
            burst: 20,
            breaker_threshold: 5,
            breaker_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    recent_times: VecDeque<i64>,
    consecutive_failures: u32,
    breaker_open_until: i64,
    total_requests: u64,
    total_limited: u64,
}

#[derive(Debug, Clone, Default)]
pub struct KeyStats {
    pub total_requests: u64,
    pub total_limited: u64,
    pub current_rps: u32,
    pub circuit_open: bool,
}

struct Inner {
    buckets: HashMap<String, Bucket>,
    configs: HashMap<String, RateLimitConfig>,
    default_config: RateLimitConfig,
}

pub struct RateLimiter {
    inner: Mutex<Inner>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                configs: HashMap::new(),
                default_config,
            }),
        }
    }

    pub fn set_config(&self, key: &str, config: RateLimitConfig) {
        self.inner.lock().configs.insert(key.to_string(), config);
    }

    pub fn check(&self, key: &str) -> RateLimitResult {
        self.check_at(key, now_ms())
    }

    fn check_at(&self, key: &str, now: i64) -> RateLimitResult {
        let mut inner = self.inner.lock();
        let config = inner
            .configs
            .get(key)
            .cloned()
            .unwrap_or_else(|| inner.default_config.clone());
        let bucket = inner.buckets.entry(key.to_string()).or_default();
        bucket.total_requests += 1;

        if bucket.breaker_open_until > now {
            bucket.total_limited += 1;
            return RateLimitResult::CircuitOpen;
        }

        let mut second = 0u32;
        let mut minute = 0u32;
        let mut hour = 0u32;
        for &t in &bucket.recent_times {
            if t > now - 1_000 {
                second += 1;
            }
            if t > now - 60_000 {
                minute += 1;
            }
            if t > now - 3_600_000 {
                hour += 1;
            }
        }

        if second >= config.per_second || minute >= config.per_minute || hour >= config.per_hour {
            bucket.total_limited += 1;
            return RateLimitResult::RateLimited;
        }

        bucket.recent_times.push_back(now);
        // Trim in one step once the deque has grown well past the window.
        if bucket.recent_times.len() > (config.burst as usize) * 10 {
            while bucket.recent_times.len() > (config.burst as usize) * 5 {
                bucket.recent_times.pop_front();
            }
        }
        RateLimitResult::Allowed
    }

    pub fn record_success(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(key) {
            bucket.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, now_ms())
    }

    fn record_failure_at(&self, key: &str, now: i64) {
        let mut inner = self.inner.lock();
        let threshold = inner
            .configs
            .get(key)
            .map(|c| c.breaker_threshold)
            .unwrap_or(inner.default_config.breaker_threshold);
        let timeout = inner
            .configs
            .get(key)
            .map(|c| c.breaker_timeout_ms)
            .unwrap_or(inner.default_config.breaker_timeout_ms);
        let bucket = inner.buckets.entry(key.to_string()).or_default();
        bucket.consecutive_failures += 1;
        if bucket.consecutive_failures >= threshold {
            bucket.breaker_open_until = now + timeout;
            tracing::warn!(key, "circuit breaker opened");
        }
    }

    pub fn reset_breaker(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.buckets.get_mut(key) {
            bucket.breaker_open_until = 0;
            bucket.consecutive_failures = 0;
        }
    }

    pub fn stats(&self, key: &str) -> KeyStats {
        let now = now_ms();
        let inner = self.inner.lock();
        let Some(bucket) = inner.buckets.get(key) else {
            return KeyStats::default();
        };
        KeyStats {
            total_requests: bucket.total_requests,
            total_limited: bucket.total_limited,
            current_rps: bucket
                .recent_times
                .iter()
                .filter(|&&t| t > now - 1_000)
                .count() as u32,
            circuit_open: bucket.breaker_open_until > now,
        }
    }

    pub fn all_stats(&self) -> Vec<(String, KeyStats)> {
        let keys: Vec<String> = self.inner.lock().buckets.keys().cloned().collect();
        keys.into_iter()
            .map(|k| {
                let s = self.stats(&k);
                (k, s)
            })
            .collect()
    }

    /// Drop timestamps outside the one-hour window.
    pub fn cleanup(&self) {
        let cutoff = now_ms() - 3_600_000;
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.values_mut() {
            while bucket
                .recent_times
                .front()
                .is_some_and(|&t| t < cutoff)
            {
                bucket.recent_times.pop_front();
            }
        }
    }

    pub fn start_cleanup(
        self: &std::sync::Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else { break };
                limiter.cleanup();
            }
        })
    }
}
