//! Rate Limiter
//!
//! Per-device token buckets bounding how often a device may reach the oracle.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct TokenBucket {
    tokens: u32,
    max_tokens: u32,
    last_refill: Instant,
    refill_every: Duration,
}

impl TokenBucket {
    fn new(max_tokens: u32, refill_every: Duration) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            last_refill: Instant::now(),
            refill_every,
        }
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        if self.refill_every.is_zero() {
            self.tokens = self.max_tokens;
            return;
        }
        let elapsed = self.last_refill.elapsed();
        let refills = (elapsed.as_secs_f64() / self.refill_every.as_secs_f64()) as u32;

        if refills > 0 {
            self.tokens = self.tokens.saturating_add(refills).min(self.max_tokens);
            self.last_refill = Instant::now();
        }
    }
}

/// Token bucket per key: `max_tokens` burst, one token back every `refill_every`.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    max_tokens: u32,
    refill_every: Duration,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_every: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_tokens,
            refill_every,
        }
    }

    /// Take one token for `key`. False when the bucket is empty.
    pub async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens, self.refill_every))
            .try_consume()
    }

    pub async fn reset(&self, key: &str) {
        self.buckets.lock().await.remove(key);
    }
}

impl Default for RateLimiter {
    /// 30 oracle calls per device, one more every two seconds.
    fn default() -> Self {
        Self::new(30, Duration::from_secs(2))
    }
}
