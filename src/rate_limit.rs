//! Per-credential token bucket. Capacity C, greedy refill of R tokens per
//! period P. One finely-locked bucket per key; rejected requests do not
//! consume tokens.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::errors::AppError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    capacity: u64,
    /// Tokens per second, derived from refill/period.
    rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: u64, refill: u64, period: Duration) -> Self {
        let secs = period.as_secs_f64().max(f64::EPSILON);
        Self {
            buckets: DashMap::new(),
            capacity: capacity.max(1),
            rate: refill as f64 / secs,
        }
    }

    /// Admit or reject the credential. On rejection the error carries
    /// ⌈nanosToNextToken / 10⁹⌉ as the retry-after hint.
    pub fn check(&self, key: &str) -> Result<(), AppError> {
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.capacity as f64,
                    last_refill: Instant::now(),
                })
            });
        let mut bucket = bucket.lock().unwrap();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let nanos_to_next = (deficit / self.rate * 1e9).max(0.0);
        let retry_after_secs = (nanos_to_next / 1e9).ceil() as u64;
        Err(AppError::RateLimited {
            retry_after_secs: retry_after_secs.max(1),
        })
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_over_capacity_is_rejected_with_retry_after() {
        // Capacity 10, refill 1 token/s; 15 requests in a burst.
        let limiter = RateLimiter::new(10, 1, Duration::from_secs(1));
        let mut admitted = 0;
        let mut rejections = Vec::new();
        for _ in 0..15 {
            match limiter.check("key-k") {
                Ok(()) => admitted += 1,
                Err(AppError::RateLimited { retry_after_secs }) => {
                    rejections.push(retry_after_secs)
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(rejections.len(), 5);
        for retry in rejections {
            assert!((1..=5).contains(&retry), "retry-after {retry} out of range");
        }
    }

    #[test]
    fn keys_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1, Duration::from_secs(60));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(1, 1, Duration::from_millis(20));
        assert!(limiter.check("k").is_ok());
        assert!(limiter.check("k").is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("k").is_ok());
    }

    #[test]
    fn sustained_rate_at_or_below_refill_is_never_rejected() {
        // Refill is instantaneous relative to consumption here; a client at
        // rate <= R sees 100% admission.
        let limiter = RateLimiter::new(5, 1_000_000, Duration::from_secs(1));
        for _ in 0..1_000 {
            assert!(limiter.check("steady").is_ok());
        }
    }
}
