//! Token bucket bounding the aggregate broadcast rate.
//!
//! One token is taken per broadcast, regardless of how many connections it
//! fans out to. Tokens refill continuously at one per `interval` up to
//! `burst`. Callers that find the bucket empty reserve their token anyway and
//! sleep until it would have been available, so waiters are served in the
//! order they arrived.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter refilling one token every `interval`, holding at most `burst`.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            interval,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token, waiting for one to become available if needed.
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Reserve a token and return how long the caller must wait for it.
    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.interval.is_zero() {
            Duration::ZERO
        } else {
            self.interval.mul_f64(-bucket.tokens)
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        if self.interval.is_zero() {
            bucket.tokens = self.burst as f64;
        } else {
            let elapsed = now.duration_since(bucket.last_refill);
            let earned = elapsed.as_secs_f64() / self.interval.as_secs_f64();
            bucket.tokens = (bucket.tokens + earned).min(self.burst as f64);
        }
        bucket.last_refill = now;
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}
