//! Client-side ceiling on trade status polls
//!
//! The trading network rate-limits offer state reads; the poller must stay
//! under that ceiling no matter how many loans are in flight.

use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::RwLock;

/// Token bucket per offer id
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens_per_second: f64, max_tokens: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_tokens);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-offer rate limiter for status polls
#[derive(Clone)]
pub struct PollRateLimiter {
    buckets: Arc<RwLock<HashMap<String, TokenBucket>>>,
    tokens_per_minute: f64,
    max_tokens: f64,
}

impl PollRateLimiter {
    /// Create a limiter with the given polls-per-minute ceiling per offer
    pub fn new(polls_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            tokens_per_minute: polls_per_minute as f64,
            // Small burst allowance of 2x the per-minute rate.
            max_tokens: (polls_per_minute * 2) as f64,
        }
    }

    /// Check whether a status poll for this offer is allowed right now
    pub async fn check(&self, offer_id: &str) -> bool {
        let mut buckets = self.buckets.write().await;

        let bucket = buckets
            .entry(offer_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens));

        let tokens_per_second = self.tokens_per_minute / 60.0;
        bucket.try_consume(tokens_per_second, self.max_tokens)
    }

    /// Drop buckets for offers that have gone quiet
    pub async fn cleanup(&self, max_age: std::time::Duration) {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < max_age);
    }
}
