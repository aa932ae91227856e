//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::context::{LimitKey, RateLimitContext};
use super::rules::{Algorithm, RateLimitConfig, StoreFailurePolicy};
use super::store::{RateLimitState, RateLimitStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Conventional rate limit response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    #[serde(rename = "X-RateLimit-Limit")]
    pub limit: u64,
    #[serde(rename = "X-RateLimit-Remaining")]
    pub remaining: u64,
    /// Unix seconds
    #[serde(rename = "X-RateLimit-Reset")]
    pub reset: u64,
    /// Seconds, present on denial
    #[serde(rename = "Retry-After", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name/value pairs, ready to attach to a response.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, String)> {
        [
            Some((HEADER_LIMIT, self.limit.to_string())),
            Some((HEADER_REMAINING, self.remaining.to_string())),
            Some((HEADER_RESET, self.reset.to_string())),
            self.retry_after
                .map(|secs| (HEADER_RETRY_AFTER, secs.to_string())),
        ]
        .into_iter()
        .flatten()
    }
}

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left before denial; never negative
    pub remaining: u64,
    pub limit: u64,
    /// When the quota resets (unix ms)
    pub reset_at: u64,
    /// Seconds to wait before retrying, present on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub headers: RateLimitHeaders,
}

impl RateLimitResult {
    fn new(allowed: bool, limit: u64, remaining: u64, reset_at: u64, now: u64) -> Self {
        let retry_after = (!allowed).then(|| ceil_secs(reset_at.saturating_sub(now)).max(1));
        Self {
            allowed,
            remaining,
            limit,
            reset_at,
            retry_after,
            headers: RateLimitHeaders {
                limit,
                remaining,
                reset: ceil_secs(reset_at),
                retry_after,
            },
        }
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Evaluates one rule against requests.
///
/// The limiter holds no counters itself; all state lives in its store under
/// keys derived from the rule name and the request's scope.
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter reading wall-clock time.
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock,
        })
    }

    /// The rule name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check `context` against the rule, recording the request if allowed.
    ///
    /// Store failures are handled according to the rule's
    /// [`StoreFailurePolicy`].
    pub async fn check(
        &self,
        context: &RateLimitContext,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        let key = LimitKey::new(&self.config.name, self.config.scope, context);
        let now = self.clock.now_ms();

        if self.is_skipped(&key) {
            trace!(key = %key, "Key is skip-listed");
            return Ok(self.unlimited(now));
        }

        trace!(
            key = %key,
            algorithm = ?self.config.algorithm,
            "Checking rate limit"
        );

        let outcome = match self.config.algorithm {
            Algorithm::FixedWindow => self.check_fixed_window(&key, now).await,
            Algorithm::SlidingWindow => self.check_sliding_window(&key, now).await,
            Algorithm::TokenBucket => self.check_token_bucket(&key, now).await,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => return self.on_store_error(&key, now, err),
        };

        if !result.allowed {
            debug!(
                key = %key,
                limit = result.limit,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(result)
    }

    /// Forget all state held for `context`'s key.
    pub async fn reset(&self, context: &RateLimitContext) -> std::result::Result<(), StoreError> {
        let key = LimitKey::new(&self.config.name, self.config.scope, context);
        let now = self.clock.now_ms();

        match self.config.algorithm {
            Algorithm::FixedWindow => {
                let window = self.config.window_ms;
                let start = now / window * window;
                self.store.delete(&format!("{key}:{start}")).await
            }
            Algorithm::SlidingWindow => {
                let window = self.config.window_ms;
                let start = now / window * window;
                self.store.delete(&format!("{key}:{start}")).await?;
                self.store
                    .delete(&format!("{key}:{}", start.saturating_sub(window)))
                    .await
            }
            Algorithm::TokenBucket => self.store.delete(&format!("{key}:bucket")).await,
        }
    }

    fn is_skipped(&self, key: &LimitKey) -> bool {
        self.config.skip_list.iter().any(|entry| key.matches(entry))
    }

    fn unlimited(&self, now: u64) -> RateLimitResult {
        RateLimitResult::new(
            true,
            self.config.max_requests,
            self.config.max_requests,
            now.saturating_add(self.config.window_ms),
            now,
        )
    }

    fn on_store_error(
        &self,
        key: &LimitKey,
        now: u64,
        err: StoreError,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        match self.config.on_store_error {
            StoreFailurePolicy::Propagate => Err(err),
            StoreFailurePolicy::FailOpen => {
                warn!(key = %key, error = %err, "Rate limit store failed, allowing request");
                Ok(self.unlimited(now))
            }
            StoreFailurePolicy::FailClosed => {
                warn!(key = %key, error = %err, "Rate limit store failed, denying request");
                Ok(RateLimitResult::new(
                    false,
                    self.config.max_requests,
                    0,
                    now.saturating_add(self.config.window_ms),
                    now,
                ))
            }
        }
    }

    async fn check_fixed_window(
        &self,
        key: &LimitKey,
        now: u64,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        let limit = self.config.max_requests;
        let window = self.config.window_ms;
        let window_start = now / window * window;
        let reset_at = window_start.saturating_add(window);
        let storage_key = format!("{key}:{window_start}");

        let count = self
            .store
            .get(&storage_key)
            .await?
            .map(|state| state.count)
            .unwrap_or(0);

        if count >= limit {
            return Ok(RateLimitResult::new(false, limit, 0, reset_at, now));
        }

        let count = self
            .store
            .increment(&storage_key, self.config.window())
            .await?;

        Ok(RateLimitResult::new(
            true,
            limit,
            limit.saturating_sub(count),
            reset_at,
            now,
        ))
    }

    async fn check_sliding_window(
        &self,
        key: &LimitKey,
        now: u64,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        let limit = self.config.max_requests;
        let window = self.config.window_ms;
        let current_start = now / window * window;
        let previous_start = current_start.saturating_sub(window);
        let reset_at = current_start.saturating_add(window);

        let keys = [
            format!("{key}:{current_start}"),
            format!("{key}:{previous_start}"),
        ];
        let mut states = self.store.get_multiple(&keys).await?.into_iter();
        let current = states.next().flatten().map(|s| s.count).unwrap_or(0);
        let previous = if previous_start < current_start {
            states.next().flatten().map(|s| s.count).unwrap_or(0)
        } else {
            0
        };

        // Boundaries are derived from `now`, so elapsed is always < window.
        let elapsed = now - current_start;
        let weight = (1.0 - elapsed as f64 / window as f64).max(0.0);
        let weighted_previous = (previous as f64 * weight).floor() as u64;
        let effective = current.saturating_add(weighted_previous);

        if effective >= limit {
            return Ok(RateLimitResult::new(false, limit, 0, reset_at, now));
        }

        // Current sub-window must outlive its turn as the previous one.
        let current = self
            .store
            .increment(&keys[0], Duration::from_millis(window.saturating_mul(2)))
            .await?;

        Ok(RateLimitResult::new(
            true,
            limit,
            limit.saturating_sub(current.saturating_add(weighted_previous)),
            reset_at,
            now,
        ))
    }

    async fn check_token_bucket(
        &self,
        key: &LimitKey,
        now: u64,
    ) -> std::result::Result<RateLimitResult, StoreError> {
        let burst = self.config.burst_size();
        let rate = self.config.refill_rate();
        let interval = self.config.refill_interval_ms();
        let storage_key = format!("{key}:bucket");

        let state = self.store.get(&storage_key).await?;
        let (mut tokens, mut last_refill, count) = match state {
            Some(state) => (
                state.tokens.unwrap_or(burst).min(burst),
                state.last_refill.unwrap_or(now),
                state.count,
            ),
            None => (burst, now, 0),
        };

        let intervals = now.saturating_sub(last_refill) / interval;
        if intervals > 0 {
            tokens = tokens
                .saturating_add(intervals.saturating_mul(rate))
                .min(burst);
            if tokens == burst {
                // A full bucket banks nothing, same as a bucket rebuilt after expiry.
                last_refill = now;
            } else {
                // Advance by whole intervals only; the partial one keeps accruing.
                last_refill = last_refill.saturating_add(intervals.saturating_mul(interval));
            }
        }

        let allowed = tokens >= 1;
        if allowed {
            tokens -= 1;
        }

        let missing = burst - tokens;
        let intervals_to_full = missing.div_ceil(rate);
        let full_at = last_refill.saturating_add(intervals_to_full.saturating_mul(interval));
        let ttl = Duration::from_millis(
            full_at
                .saturating_sub(now)
                .max(self.config.window_ms)
                .max(interval),
        );

        self.store
            .set(
                &storage_key,
                RateLimitState {
                    count: if allowed { count.saturating_add(1) } else { count },
                    window_start: last_refill,
                    tokens: Some(tokens),
                    last_refill: Some(last_refill),
                },
                ttl,
            )
            .await?;

        let reset_at = if allowed {
            full_at.max(now)
        } else {
            last_refill.saturating_add(interval)
        };

        Ok(RateLimitResult::new(allowed, burst, tokens, reset_at, now))
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
