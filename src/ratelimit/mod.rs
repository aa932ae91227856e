//! Rate limiting rules, algorithms and state storage.

mod context;
mod limiter;
mod registry;
mod rules;
mod store;

pub use context::{LimitKey, RateLimitContext, UNKNOWN};
pub use limiter::{
    RateLimitHeaders, RateLimitResult, RateLimiter, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use registry::{CheckAllResult, RateLimiterRegistry};
pub use rules::{
    Algorithm, RateLimitConfig, RateLimitConfigBuilder, RateLimitPreset, Scope,
    StoreFailurePolicy,
};
pub use store::{MemoryStore, RateLimitState, RateLimitStore};
