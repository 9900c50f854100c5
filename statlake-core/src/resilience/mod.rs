//! Domain-agnostic resilience primitives: circuit breaker and sliding-window rate limiter.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    BreakerPermit, CallError, CircuitBreaker, CircuitOpen, CircuitSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimitRule, RateLimiter};
