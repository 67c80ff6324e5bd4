//! Resilience patterns shared by every transfer
//!
//! Each pattern is a standalone, internally synchronized component that the
//! engine shares across concurrent batches.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitBreakerState,
    CircuitBreakerStats,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStats};
pub use retry::{
    BackoffStrategy, JitterStrategy, RetryConfig, RetryExecutor, RetryOutcome, RetryStats,
};
