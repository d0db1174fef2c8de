//! Token-bucket rate limiting: one global bucket plus lazily created
//! per-credential buckets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

const BURST_MULTIPLIER: f64 = 3.0;
const CREDENTIAL_MAP_CAP: usize = 200;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute as f64 * BURST_MULTIPLIER;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: rate_per_minute as f64 / 60.0,
            last: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_minute: u32,
    global: Mutex<Bucket>,
    per_credential: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32) -> Self {
        Self {
            rate_per_minute,
            global: Mutex::new(Bucket::new(rate_per_minute)),
            per_credential: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rate_per_minute > 0
    }

    /// Global bucket; `(allowed, reason)`. A disabled limiter always allows.
    pub fn check_global(&self) -> (bool, Option<&'static str>) {
        if !self.enabled() {
            return (true, None);
        }
        if let Ok(mut global) = self.global.lock()
            && !global.try_take()
        {
            return (false, Some("global_rate_limit"));
        }
        (true, None)
    }

    /// Per-credential bucket, created lazily. Does not touch the global
    /// bucket; callers check that once per request.
    pub fn check_credential(&self, id: &str) -> (bool, Option<&'static str>) {
        if !self.enabled() {
            return (true, None);
        }
        if let Ok(mut map) = self.per_credential.lock() {
            if map.len() > CREDENTIAL_MAP_CAP {
                map.clear();
            }
            let bucket = map
                .entry(id.to_string())
                .or_insert_with(|| Bucket::new(self.rate_per_minute));
            if !bucket.try_take() {
                return (false, Some("credential_rate_limit"));
            }
        }
        (true, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(0);
        for _ in 0..10_000 {
            assert!(limiter.check_global().0);
            assert!(limiter.check_credential("c").0);
        }
    }

    #[test]
    fn burst_then_block() {
        let limiter = RateLimiter::new(10);
        // Burst capacity is rate * 3.
        for _ in 0..30 {
            assert!(limiter.check_global().0);
        }
        let (allowed, reason) = limiter.check_global();
        assert!(!allowed);
        assert_eq!(reason, Some("global_rate_limit"));
    }

    #[test]
    fn per_credential_bucket_is_independent() {
        let limiter = RateLimiter::new(1000);
        for _ in 0..100 {
            assert!(limiter.check_credential("a").0);
        }
        assert!(limiter.check_credential("b").0);
    }

    #[test]
    fn oversized_credential_map_is_pruned() {
        let limiter = RateLimiter::new(100_000);
        for i in 0..(CREDENTIAL_MAP_CAP + 10) {
            limiter.check_credential(&format!("cred-{i}"));
        }
        let len = limiter.per_credential.lock().unwrap().len();
        assert!(len <= CREDENTIAL_MAP_CAP + 1);
    }
}
