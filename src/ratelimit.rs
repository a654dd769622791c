//! Per-client token-bucket admission control.
//!
//! One bucket per client key, created lazily at full capacity on first
//! sight. Buckets refill continuously at `requests_per_minute / 60` tokens
//! per second up to the burst capacity, and each admitted request costs one
//! token. Keys live in a [`DashMap`] so unrelated clients never contend on a
//! single lock; each bucket's read-modify-write happens under its shard guard.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    /// Always in `[0, burst]`.
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    refill_per_second: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            refill_per_second: config.refill_per_second(),
            burst: config.burst(),
        }
    }

    /// Admission check: refill the client's bucket for the elapsed time, then
    /// spend one token if available. A first-seen key gets a full bucket and
    /// is charged like any other request.
    pub fn allow(&self, client_key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .buckets
            .entry(client_key.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                last_refill: now,
            });
        let bucket = entry.value_mut();

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            tracing::debug!(client_key, tokens = bucket.tokens, "Request rejected");
            false
        }
    }

    /// Time until the client's bucket would hold at least one token, computed
    /// without mutating any state. Zero if a request would be admitted now.
    pub fn retry_after(&self, client_key: &str) -> Duration {
        let Some(bucket) = self.buckets.get(client_key) else {
            return Duration::ZERO;
        };
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        let tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.burst);
        if tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_per_second <= 0.0 {
            // A zero refill rate never recovers; report the longest possible wait.
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - tokens) / self.refill_per_second)
    }

    /// Drop buckets idle for longer than `max_age`, bounding memory growth
    /// from one-off clients. Returns the number of buckets removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) <= max_age);
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
