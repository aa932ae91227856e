//! Rampart - Circuit Breakers and Rate Limiting
//!
//! This crate protects shared dependencies and public endpoints from
//! cascading failure and abusive load. It provides per-dependency circuit
//! breakers and a rate limiter with fixed-window, sliding-window and
//! token-bucket algorithms over a pluggable counter store. It performs no
//! network I/O of its own: callers supply the protected operations and,
//! optionally, a networked store.

pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;

pub use circuit::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError,
    CircuitState,
};
pub use error::{RampartError, Result, StoreError};
pub use ratelimit::{
    RateLimitConfig, RateLimitContext, RateLimitResult, RateLimitStore, RateLimiter,
    RateLimiterRegistry,
};
