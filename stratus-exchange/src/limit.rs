use parking_lot::Mutex;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Per-endpoint token buckets, sized below the venue's published limits by a
/// safety margin.
///
/// `acquire` waits up to a bounded budget for a token; callers translate an
/// exhausted wait into a `rate_limited` failure rather than blocking
/// indefinitely.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<&'static str, Bucket>>,
    safety_margin: Decimal,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available, or zero if one is ready now.
    fn time_to_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

impl RateLimiter {
    pub fn new(safety_margin: Decimal) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            safety_margin,
        }
    }

    /// Register an endpoint bucket from its published tokens-per-minute
    /// budget. The effective budget is scaled down by the safety margin.
    pub fn register(&self, endpoint: &'static str, tokens_per_min: u32) {
        let margin = self.safety_margin.to_f64().unwrap_or(0.1).clamp(0.0, 0.9);
        let effective = (tokens_per_min as f64) * (1.0 - margin);
        let capacity = effective.max(1.0);
        self.buckets.lock().insert(
            endpoint,
            Bucket {
                capacity,
                tokens: capacity,
                refill_per_sec: effective.max(0.01) / 60.0,
                last_refill: Instant::now(),
            },
        );
    }

    /// Take one token for `endpoint`, waiting at most `budget`.
    ///
    /// Returns `false` when the bucket stayed empty past the budget -
    /// the caller's cue to fail with kind `rate_limited`. Unregistered
    /// endpoints are unlimited.
    pub async fn acquire(&self, endpoint: &'static str, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let Some(bucket) = buckets.get_mut(endpoint) else {
                    return true;
                };
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }
                bucket.time_to_token()
            };

            let now = Instant::now();
            if now + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Whether the endpoint's bucket is currently empty - the saturation
    /// signal surfaced on `alerts.rate_limit`.
    pub fn is_saturated(&self, endpoint: &'static str) -> bool {
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(endpoint) {
            Some(bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens < 1.0
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_bucket_depletes_and_rejects() {
        let limiter = RateLimiter::new(dec!(0.5));
        // 4 per minute with 50% margin: capacity 2.
        limiter.register("order", 4);

        assert!(limiter.acquire("order", Duration::ZERO).await);
        assert!(limiter.acquire("order", Duration::ZERO).await);
        // Third within the same instant exceeds the bucket.
        assert!(!limiter.acquire("order", Duration::from_millis(10)).await);
        assert!(limiter.is_saturated("order"));
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_is_unlimited() {
        let limiter = RateLimiter::new(dec!(0.1));
        for _ in 0..100 {
            assert!(limiter.acquire("klines", Duration::ZERO).await);
        }
    }

    #[tokio::test]
    async fn test_bucket_refills_over_time() {
        let limiter = RateLimiter::new(dec!(0));
        // 6000 per minute: a ~10ms refill interval keeps this test quick.
        limiter.register("order", 6000);

        // Drain the whole bucket.
        while limiter.acquire("order", Duration::ZERO).await {}

        // A bounded wait long enough for one refill succeeds.
        assert!(limiter.acquire("order", Duration::from_secs(1)).await);
    }
}
