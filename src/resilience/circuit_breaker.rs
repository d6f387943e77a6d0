//! Circuit breaker for failing upstream dependencies.
//!
//! Closed -> Open after `failure_threshold` consecutive failures; Open rejects
//! immediately until `reset_timeout` elapses, then a single half-open trial is
//! admitted. Trial success closes the circuit, trial failure re-opens it.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-breaker thresholds. Providers carry different profiles: looser for the
/// authoritative official feed, stricter for secondary/aggregator sources.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a half-open trial is admitted.
    pub reset_timeout: Duration,
    /// Per-call timeout; an elapsed call counts as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            opened_at: None,
        }
    }
}

/// Snapshot of breaker counters for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

/// Why a guarded call did not produce a value.
#[derive(Debug)]
pub enum BreakerError {
    /// Circuit is open; no call was attempted.
    Open { name: String, retry_in: Duration },
    /// The call exceeded the configured timeout.
    Timeout { name: String, after: Duration },
    /// The call itself failed.
    Inner(anyhow::Error),
}

impl std::fmt::Display for BreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open { name, retry_in } => {
                write!(f, "circuit open for {} (retry in {:?})", name, retry_in)
            }
            BreakerError::Timeout { name, after } => {
                write!(f, "call to {} timed out after {:?}", name, after)
            }
            BreakerError::Inner(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for BreakerError {}

enum Admission {
    Allow,
    Reject { retry_in: Duration },
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run an operation under the breaker with the configured call timeout.
    pub async fn execute<T, F>(&self, op: F) -> Result<T, BreakerError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match self.try_acquire() {
            Admission::Reject { retry_in } => {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_in,
                });
            }
            Admission::Allow => {}
        }

        match tokio::time::timeout(self.config.call_timeout, op).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                self.on_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }

    /// Whether a call admitted right now would be attempted.
    pub fn is_available(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => inner
                .opened_at
                .map(|t| t.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true),
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force the circuit back to Closed and zero the failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        info!(breaker = %self.name, "Circuit manually reset");
    }

    fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allow,
            // A trial is already in flight; hold further calls back.
            CircuitState::HalfOpen => Admission::Reject {
                retry_in: self.config.reset_timeout,
            },
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    debug!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    Admission::Allow
                } else {
                    inner.total_rejections += 1;
                    Admission::Reject {
                        retry_in: self.config.reset_timeout - elapsed,
                    }
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Half-open trial failed, circuit re-opened");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "Failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }
}

/// Process-wide registry handing out one breaker per provider name.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn all_stats(&self) -> Vec<BreakerStats> {
        self.breakers.read().values().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            call_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            let r: Result<(), _> = breaker.execute(async { Err(anyhow!("boom")) }).await;
            assert!(matches!(r, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.stats().state, CircuitState::Open);

        // Rejected without the operation running.
        let r: Result<(), _> = breaker.execute(async { Ok(()) }).await;
        assert!(matches!(r, Err(BreakerError::Open { .. })));
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..2 {
            let _: Result<(), _> = breaker.execute(async { Err(anyhow!("boom")) }).await;
        }
        let _: Result<(), _> = breaker.execute(async { Ok(()) }).await;
        let _: Result<(), _> = breaker.execute(async { Err(anyhow!("boom")) }).await;

        assert_eq!(breaker.stats().state, CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _: Result<(), _> = breaker.execute(async { Err(anyhow!("boom")) }).await;
        }
        assert_eq!(breaker.stats().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.is_available());

        let r: Result<u32, _> = breaker.execute(async { Ok(7) }).await;
        assert_eq!(r.unwrap(), 7);
        assert_eq!(breaker.stats().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let _: Result<(), _> = breaker.execute(async { Err(anyhow!("boom")) }).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        let r: Result<(), _> = breaker.execute(async { Err(anyhow!("still down")) }).await;
        assert!(matches!(r, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.stats().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(10),
                call_timeout: Duration::from_millis(20),
            },
        );

        let r: Result<(), _> = breaker
            .execute(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        assert!(matches!(r, Err(BreakerError::Timeout { .. })));
        assert_eq!(breaker.stats().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_reuses_instances() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("official", fast_config());
        let b = registry.get_or_create("official", fast_config());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all_stats().len(), 1);
    }
}
