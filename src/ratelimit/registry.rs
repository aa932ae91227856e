//! Named rate limiters sharing a default store.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info};

use super::context::RateLimitContext;
use super::limiter::{RateLimitResult, RateLimiter};
use super::rules::{RateLimitConfig, RateLimitPreset};
use super::store::{MemoryStore, RateLimitStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};

/// Combined outcome of checking several limiters.
#[derive(Debug, Clone, Serialize)]
pub struct CheckAllResult {
    /// False if any limiter denied
    pub allowed: bool,
    /// Each evaluated limiter's result, in evaluation order
    pub results: Vec<(String, RateLimitResult)>,
    /// The first limiter that denied, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denying_limiter: Option<String>,
}

impl CheckAllResult {
    /// The result from the denying limiter, if any.
    pub fn denial(&self) -> Option<&RateLimitResult> {
        let name = self.denying_limiter.as_deref()?;
        self.results
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, result)| result)
    }
}

/// Holds rate limiters by name.
///
/// Limiters registered without an explicit store share the registry's
/// default store.
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
    default_store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiterRegistry {
    /// Create a registry with an in-process default store.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a registry with `store` as the default store.
    pub fn with_store(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            limiters: DashMap::new(),
            default_store: store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a registry whose limiters and default store read `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: DashMap::new(),
            default_store: Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
        }
    }

    /// Build a registry holding every rule in `configs`.
    pub fn from_configs(configs: &[RateLimitConfig]) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            registry.register(config.clone(), None)?;
        }
        Ok(registry)
    }

    /// The store used when none is given at registration.
    pub fn default_store(&self) -> Arc<dyn RateLimitStore> {
        self.default_store.clone()
    }

    /// Create a limiter for `config`, replacing any limiter of the same name.
    pub fn register(
        &self,
        config: RateLimitConfig,
        store: Option<Arc<dyn RateLimitStore>>,
    ) -> Result<Arc<RateLimiter>> {
        let store = store.unwrap_or_else(|| self.default_store.clone());
        let name = config.name.clone();
        let limiter = Arc::new(RateLimiter::with_clock(config, store, self.clock.clone())?);

        if self.limiters.insert(name.clone(), limiter.clone()).is_some() {
            info!(limiter = %name, "Replaced rate limiter");
        } else {
            info!(limiter = %name, "Registered rate limiter");
        }
        Ok(limiter)
    }

    /// Register a preset under its default name.
    pub fn register_preset(&self, preset: RateLimitPreset) -> Result<Arc<RateLimiter>> {
        self.register(preset.config(), None)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.remove(name).map(|(_, limiter)| limiter)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Check `context` against the named limiters, or all of them.
    ///
    /// Every selected limiter is evaluated and records usage, even after one
    /// has denied. `names` order is the evaluation order; otherwise limiters
    /// are evaluated in name order. Unknown names are skipped.
    pub async fn check_all(
        &self,
        context: &RateLimitContext,
        names: Option<&[&str]>,
    ) -> std::result::Result<CheckAllResult, StoreError> {
        let selected: Vec<Arc<RateLimiter>> = match names {
            Some(names) => names
                .iter()
                .enumerate()
                // A name listed twice is evaluated once
                .filter(|&(i, name)| !names[..i].contains(name))
                .filter_map(|(_, name)| {
                    let limiter = self.get(name);
                    if limiter.is_none() {
                        debug!(limiter = %name, "Skipping unknown rate limiter");
                    }
                    limiter
                })
                .collect(),
            None => self
                .names()
                .iter()
                .filter_map(|name| self.get(name))
                .collect(),
        };

        let outcomes = join_all(selected.iter().map(|limiter| limiter.check(context))).await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut denying_limiter = None;
        for (limiter, outcome) in selected.iter().zip(outcomes) {
            let result = outcome?;
            if !result.allowed && denying_limiter.is_none() {
                denying_limiter = Some(limiter.name().to_string());
            }
            results.push((limiter.name().to_string(), result));
        }

        Ok(CheckAllResult {
            allowed: denying_limiter.is_none(),
            results,
            denying_limiter,
        })
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::rules::Scope;
    use std::time::Duration;

    fn registry() -> RateLimiterRegistry {
        RateLimiterRegistry::with_clock(Arc::new(ManualClock::new(1_700_000_040_000)))
    }

    fn rule(name: &str, max: u64) -> RateLimitConfig {
        RateLimitConfig::builder(name)
            .max_requests(max)
            .window(Duration::from_secs(60))
            .scope(Scope::Ip)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        assert!(registry.is_empty());

        registry.register(rule("a", 1), None).unwrap();
        registry.register_preset(RateLimitPreset::Login).unwrap();

        assert_eq!(registry.names(), vec!["a".to_string(), "login".to_string()]);
        assert_eq!(registry.get("login").unwrap().config().max_requests, 5);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_register_overwrites() {
        let registry = registry();
        registry.register(rule("a", 1), None).unwrap();
        registry.register(rule("a", 7), None).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().config().max_requests, 7);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let registry = registry();
        let mut config = rule("bad", 1);
        config.max_requests = 0;
        assert!(registry.register(config, None).is_err());
        assert!(registry.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_explicit_store_is_used() {
        let registry = registry();
        let store = Arc::new(MemoryStore::new());
        registry
            .register(rule("own", 5), Some(store.clone() as Arc<dyn RateLimitStore>))
            .unwrap();
        registry.register(rule("shared", 5), None).unwrap();

        let ctx = RateLimitContext::new().ip("1.1.1.1");
        registry.check_all(&ctx, None).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_check_all_reports_first_denial_and_records_every_limiter() {
        let registry = registry();
        registry.register(rule("burst", 1), None).unwrap();
        registry.register(rule("hourly", 10), None).unwrap();
        let ctx = RateLimitContext::new().ip("10.0.0.1");

        let first = registry.check_all(&ctx, None).await.unwrap();
        assert!(first.allowed);
        assert!(first.denying_limiter.is_none());
        assert_eq!(first.results.len(), 2);

        let second = registry.check_all(&ctx, None).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.denying_limiter.as_deref(), Some("burst"));
        assert!(!second.denial().unwrap().allowed);

        // "hourly" still counted both requests
        let (name, hourly) = &second.results[1];
        assert_eq!(name, "hourly");
        assert_eq!(hourly.remaining, 8);
    }

    #[tokio::test]
    async fn test_check_all_subset() {
        let registry = registry();
        registry.register(rule("strict", 1), None).unwrap();
        registry.register(rule("loose", 100), None).unwrap();
        let ctx = RateLimitContext::new().ip("10.0.0.1");

        for _ in 0..3 {
            let result = registry
                .check_all(&ctx, Some(&["loose", "unknown"][..]))
                .await
                .unwrap();
            assert!(result.allowed);
            assert_eq!(result.results.len(), 1);
        }

        // "strict" was never touched by the subset checks
        let result = registry.check_all(&ctx, Some(&["strict"][..])).await.unwrap();
        assert!(result.allowed);
    }

    #[tokio::test]
    async fn test_check_all_evaluates_repeated_name_once() {
        let registry = registry();
        registry.register(rule("pair", 2), None).unwrap();
        let ctx = RateLimitContext::new().ip("10.0.0.1");

        let result = registry
            .check_all(&ctx, Some(&["pair", "pair"][..]))
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].1.remaining, 1);

        // One request consumed one unit, so a second still fits
        let result = registry.check_all(&ctx, Some(&["pair"][..])).await.unwrap();
        assert!(result.allowed);
    }
}
