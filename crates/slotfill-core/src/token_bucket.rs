//! Token bucket rate limiter shared by every slot worker.
//!
//! The upstream quota is global, so all in-flight slot workers draw from one
//! bucket. [`TokenBucket`] is the plain, clock-injected algorithm;
//! [`RateGate`] wraps it behind an async mutex and sleeps until a token is
//! available.
//!
//! # Algorithm
//!
//! - Bucket holds up to `capacity` tokens.
//! - Tokens refill at `refill_rate` tokens per second.
//! - Each request costs one token.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

// =============================================================================
// TokenBucket
// =============================================================================

/// A token bucket rate limiter.
///
/// Uses a timestamp-based lazy refill: tokens accumulate between calls
/// without background threads.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens the bucket can hold.
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Current available tokens.
    tokens: f64,
    /// Last refill timestamp (milliseconds).
    last_refill_ms: u64,
    /// Total tokens consumed.
    total_consumed: u64,
    /// Total requests denied.
    total_denied: u64,
}

impl TokenBucket {
    /// Create a new token bucket. Starts full.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` or `refill_rate` is not positive.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        assert!(capacity > 0.0, "capacity must be positive");
        assert!(refill_rate > 0.0, "refill_rate must be positive");
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill_ms: 0,
            total_consumed: 0,
            total_denied: 0,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    /// Try to consume `cost` tokens. Returns `true` if successful.
    pub fn try_acquire(&mut self, cost: u32, now_ms: u64) -> bool {
        self.refill(now_ms);
        let cost_f = cost as f64;
        if self.tokens >= cost_f {
            self.tokens -= cost_f;
            self.total_consumed += cost as u64;
            true
        } else {
            self.total_denied += 1;
            false
        }
    }

    /// How long (in ms) until `cost` tokens are available.
    #[must_use]
    pub fn wait_time_ms(&mut self, cost: u32, now_ms: u64) -> u64 {
        self.refill(now_ms);
        let deficit = cost as f64 - self.tokens;
        if deficit <= 0.0 {
            0
        } else {
            (deficit / self.refill_rate * 1000.0).ceil() as u64
        }
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            current_tokens: self.tokens,
            total_consumed: self.total_consumed,
            total_denied: self.total_denied,
        }
    }
}

/// Serializable statistics about a token bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStats {
    pub capacity: f64,
    pub refill_rate: f64,
    pub current_tokens: f64,
    pub total_consumed: u64,
    pub total_denied: u64,
}

// =============================================================================
// RateGate
// =============================================================================

/// Async, shareable front for a [`TokenBucket`].
///
/// Wrap in an `Arc` and hand the same gate to every slot worker.
#[derive(Debug)]
pub struct RateGate {
    bucket: Mutex<TokenBucket>,
    epoch: Instant,
}

impl RateGate {
    #[must_use]
    pub fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket: Mutex::new(bucket),
            epoch: Instant::now(),
        }
    }

    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(TokenBucket::new(config.capacity, config.refill_per_sec))
    }

    /// A gate that never blocks in practice.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(TokenBucket::new(f64::from(u32::MAX), f64::from(u32::MAX)))
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Wait until one request token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait_ms = {
                let mut bucket = self.bucket.lock().await;
                let now = self.now_ms();
                if bucket.try_acquire(1, now) {
                    return;
                }
                bucket.wait_time_ms(1, now)
            };
            tracing::trace!(wait_ms, "Rate gate waiting for token");
            tokio::time::sleep(Duration::from_millis(wait_ms.max(1))).await;
        }
    }

    pub async fn stats(&self) -> BucketStats {
        self.bucket.lock().await.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_full_and_drains() {
        let mut bucket = TokenBucket::new(3.0, 1.0);
        assert!(bucket.try_acquire(1, 0));
        assert!(bucket.try_acquire(1, 0));
        assert!(bucket.try_acquire(1, 0));
        assert!(!bucket.try_acquire(1, 0));
        assert_eq!(bucket.stats().total_consumed, 3);
        assert_eq!(bucket.stats().total_denied, 1);
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(2.0, 2.0);
        assert!(bucket.try_acquire(2, 0));
        assert_eq!(bucket.wait_time_ms(1, 0), 500);
        assert!(bucket.try_acquire(1, 500));
    }

    #[test]
    fn refill_capped_at_capacity() {
        let mut bucket = TokenBucket::new(2.0, 10.0);
        assert!(bucket.try_acquire(2, 60_000));
        assert!(!bucket.try_acquire(1, 60_000));
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_panics() {
        let _ = TokenBucket::new(0.0, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_blocks_until_refill() {
        let gate = Arc::new(RateGate::new(TokenBucket::new(1.0, 1.0)));
        let start = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(gate.stats().await.total_consumed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_shared_across_tasks() {
        let gate = Arc::new(RateGate::new(TokenBucket::new(2.0, 1.0)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move { gate.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Two burst tokens, then one per second for the remaining two.
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }
}
