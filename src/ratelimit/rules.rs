//! Rate limit rule configuration.
//!
//! A [`RateLimitConfig`] names one rule: how many requests, over which window,
//! under which algorithm, partitioned along which scope. Rules deserialize
//! from YAML and are validated before a limiter is built from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RampartError, Result};

/// Counting algorithm used by a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Independent, epoch-aligned windows
    #[default]
    FixedWindow,
    /// Current window plus a linearly decaying share of the previous one
    SlidingWindow,
    /// Capped reserve of tokens refilled at a steady rate
    TokenBucket,
}

/// Dimension along which request counts are partitioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One counter shared by every caller
    #[default]
    Global,
    Tenant,
    User,
    ApiKey,
    Ip,
    /// Method and endpoint
    Endpoint,
    /// Tenant, user and endpoint together
    Composite,
}

/// What a limiter does when its store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Allow the request
    FailOpen,
    /// Deny the request
    FailClosed,
}

/// Configuration for one named rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Rule name, also the storage key prefix
    pub name: String,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub scope: Scope,
    /// Token bucket capacity (defaults to `max_requests`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_size: Option<u64>,
    /// Tokens credited per refill interval (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<u64>,
    /// Refill interval in milliseconds (defaults to `window_ms / max_requests`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_interval_ms: Option<u64>,
    /// Derived keys (or scope identities) that are never limited
    #[serde(default)]
    pub skip_list: Vec<String>,
    #[serde(default)]
    pub on_store_error: StoreFailurePolicy,
}

impl RateLimitConfig {
    /// Start building a rule with the given name.
    pub fn builder(name: impl Into<String>) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new(name)
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Effective token bucket capacity.
    pub fn burst_size(&self) -> u64 {
        self.burst_size.unwrap_or(self.max_requests)
    }

    /// Effective tokens per refill interval.
    pub fn refill_rate(&self) -> u64 {
        self.refill_rate.unwrap_or(1)
    }

    /// Effective refill interval in milliseconds.
    pub fn refill_interval_ms(&self) -> u64 {
        self.refill_interval_ms
            .unwrap_or_else(|| (self.window_ms / self.max_requests.max(1)).max(1))
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RampartError::invalid(&self.name, "name", "must not be empty"));
        }
        if self.max_requests == 0 {
            return Err(RampartError::invalid(&self.name, "max_requests", "must be > 0"));
        }
        if self.window_ms == 0 {
            return Err(RampartError::invalid(&self.name, "window_ms", "must be > 0"));
        }
        if self.burst_size == Some(0) {
            return Err(RampartError::invalid(&self.name, "burst_size", "must be > 0"));
        }
        if self.refill_rate == Some(0) {
            return Err(RampartError::invalid(&self.name, "refill_rate", "must be > 0"));
        }
        if self.refill_interval_ms == Some(0) {
            return Err(RampartError::invalid(
                &self.name,
                "refill_interval_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            config: RateLimitConfig {
                name: name.into(),
                max_requests: 100,
                window_ms: 60_000,
                algorithm: Algorithm::default(),
                scope: Scope::default(),
                burst_size: None,
                refill_rate: None,
                refill_interval_ms: None,
                skip_list: Vec::new(),
                on_store_error: StoreFailurePolicy::default(),
            },
        }
    }

    fn from_config(config: RateLimitConfig) -> Self {
        Self { config }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window_ms = window.as_millis() as u64;
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.config.scope = scope;
        self
    }

    pub fn burst_size(mut self, burst_size: u64) -> Self {
        self.config.burst_size = Some(burst_size);
        self
    }

    pub fn refill_rate(mut self, refill_rate: u64) -> Self {
        self.config.refill_rate = Some(refill_rate);
        self
    }

    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.config.refill_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Exempt a derived key or scope identity (e.g. `ip:10.0.0.1`).
    pub fn skip(mut self, key: impl Into<String>) -> Self {
        self.config.skip_list.push(key.into());
        self
    }

    pub fn on_store_error(mut self, policy: StoreFailurePolicy) -> Self {
        self.config.on_store_error = policy;
        self
    }

    pub fn build(self) -> Result<RateLimitConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Named rule bundles for common endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPreset {
    /// 5 per 5 minutes, fixed window, composite scope
    Login,
    /// 30 per minute, sliding window, per user
    Payment,
    /// 1000 per minute, sliding window, per tenant
    Api,
    /// 100 per minute, token bucket, per API key
    PublicApi,
    /// 3 per hour, fixed window, per IP
    PasswordReset,
    /// 60 per minute, sliding window, per user
    Search,
    /// 10 per minute, token bucket, per user
    Upload,
}

impl RateLimitPreset {
    pub const ALL: [RateLimitPreset; 7] = [
        RateLimitPreset::Login,
        RateLimitPreset::Payment,
        RateLimitPreset::Api,
        RateLimitPreset::PublicApi,
        RateLimitPreset::PasswordReset,
        RateLimitPreset::Search,
        RateLimitPreset::Upload,
    ];

    /// Default rule name for this preset.
    pub fn name(&self) -> &'static str {
        match self {
            RateLimitPreset::Login => "login",
            RateLimitPreset::Payment => "payment",
            RateLimitPreset::Api => "api",
            RateLimitPreset::PublicApi => "public_api",
            RateLimitPreset::PasswordReset => "password_reset",
            RateLimitPreset::Search => "search",
            RateLimitPreset::Upload => "upload",
        }
    }

    /// The preset's rule.
    pub fn config(&self) -> RateLimitConfig {
        let (max_requests, window_secs, algorithm, scope) = match self {
            RateLimitPreset::Login => (5, 300, Algorithm::FixedWindow, Scope::Composite),
            RateLimitPreset::Payment => (30, 60, Algorithm::SlidingWindow, Scope::User),
            RateLimitPreset::Api => (1000, 60, Algorithm::SlidingWindow, Scope::Tenant),
            RateLimitPreset::PublicApi => (100, 60, Algorithm::TokenBucket, Scope::ApiKey),
            RateLimitPreset::PasswordReset => (3, 3600, Algorithm::FixedWindow, Scope::Ip),
            RateLimitPreset::Search => (60, 60, Algorithm::SlidingWindow, Scope::User),
            RateLimitPreset::Upload => (10, 60, Algorithm::TokenBucket, Scope::User),
        };

        RateLimitConfig {
            name: self.name().to_string(),
            max_requests,
            window_ms: window_secs * 1000,
            algorithm,
            scope,
            burst_size: None,
            refill_rate: None,
            refill_interval_ms: None,
            skip_list: Vec::new(),
            on_store_error: StoreFailurePolicy::default(),
        }
    }

    /// A builder seeded with this preset, for overriding individual fields.
    pub fn builder(&self) -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::from_config(self.config())
    }
}
