//! Token bucket rate limiter for the global bytes/sec cap
//!
//! One limiter is shared by every transfer worker, so the cap applies to the
//! whole run rather than to each asset.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Largest slice a single acquire takes from the bucket, so workers interleave
const MAX_ACQUIRE: u64 = 16 * 1024;

/// Longest a waiter sleeps before re-checking the bucket
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Global rate limiter using the token bucket algorithm
#[derive(Clone, Debug)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
}

#[derive(Debug)]
struct Bucket {
    /// Tokens (bytes) added per second, also the bucket capacity
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.001 {
            self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
            self.last_refill = now;
        }
    }
}

impl RateLimiter {
    /// Limit to `bytes_per_second`; `None` or zero means unlimited
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        match bytes_per_second {
            Some(rate) if rate > 0 => Self {
                bucket: Some(Arc::new(Mutex::new(Bucket {
                    rate,
                    tokens: rate as f64,
                    last_refill: Instant::now(),
                }))),
            },
            _ => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Wait until `bytes` may be transferred
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remaining = bytes;
        while remaining > 0 {
            let want = remaining.min(MAX_ACQUIRE);
            let wait = {
                let mut bucket = bucket.lock().await;
                bucket.refill();

                let want = want.min(bucket.rate);
                if bucket.tokens >= want as f64 {
                    bucket.tokens -= want as f64;
                    remaining -= want;
                    Duration::ZERO
                } else {
                    let needed = want as f64 - bucket.tokens;
                    Duration::from_secs_f64(needed / bucket.rate as f64).min(MAX_WAIT)
                }
            };

            // Sleep outside the lock so other workers can take their share
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
