//! Resilience primitives guarding upstream provider calls.
//!
//! Each provider gets its own circuit breaker and token-bucket rate limiter;
//! state is process-wide with a single logical owner (the fetch path).

pub mod circuit_breaker;
pub mod rate_limit;

pub use circuit_breaker::*;
pub use rate_limit::*;
