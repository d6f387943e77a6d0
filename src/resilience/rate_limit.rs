//! Token-bucket rate limiting for upstream provider calls.
//!
//! Exhaustion short-circuits the provider call before it reaches the network,
//! so a rate-limited attempt never touches the circuit breaker's failure count.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket holds (burst size).
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 2.0,
        }
    }
}

/// Outcome of a single `consume()` attempt.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// When the next token becomes available, for denied attempts.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    pub capacity: u32,
    pub available_tokens: f64,
    pub denied_total: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    denied_total: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
                denied_total: 0,
            }),
        }
    }

    /// Take one token if available.
    pub fn consume(&self) -> RateDecision {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            RateDecision {
                allowed: true,
                retry_after: None,
            }
        } else {
            state.denied_total += 1;
            // No refill rate means the bucket never recovers; leave
            // retry_after unset rather than reporting an infinite wait.
            let retry_after = if self.config.refill_per_sec > 0.0 {
                let deficit = 1.0 - state.tokens;
                Some(Duration::from_secs_f64(deficit / self.config.refill_per_sec))
            } else {
                None
            };
            RateDecision {
                allowed: false,
                retry_after,
            }
        }
    }

    pub fn status(&self) -> RateLimiterStatus {
        let mut state = self.state.lock();
        self.refill(&mut state);
        RateLimiterStatus {
            capacity: self.config.capacity,
            available_tokens: state.tokens,
            denied_total: state.denied_total,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        state.last_refill = Instant::now();
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.capacity as f64);
    }
}
