//! Circuit breaker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RampartError, Result};

/// Configuration for one named circuit breaker.
///
/// Durations are carried as milliseconds so configs round-trip through YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Breaker name, one per protected dependency
    pub name: String,
    /// Failures within `failure_window_ms` that open the circuit
    pub failure_threshold: u32,
    /// How far back failures are counted
    pub failure_window_ms: u64,
    /// Time spent open before a probe call is let through
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    /// Calls running longer than this fail
    pub call_timeout_ms: u64,
    /// Successful calls slower than this are counted as slow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_call_threshold_ms: Option<u64>,
}

impl CircuitBreakerConfig {
    /// Start building a config with the given name.
    pub fn builder(name: impl Into<String>) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new(name)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn slow_call_threshold(&self) -> Option<Duration> {
        self.slow_call_threshold_ms.map(Duration::from_millis)
    }

    /// Check the config's invariants.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("failure_threshold", u64::from(self.failure_threshold)),
            ("failure_window_ms", self.failure_window_ms),
            ("reset_timeout_ms", self.reset_timeout_ms),
            ("success_threshold", u64::from(self.success_threshold)),
            ("call_timeout_ms", self.call_timeout_ms),
        ];

        if self.name.trim().is_empty() {
            return Err(RampartError::invalid(&self.name, "name", "must not be empty"));
        }
        for (field, value) in positive {
            if value == 0 {
                return Err(RampartError::invalid(&self.name, field, "must be > 0"));
            }
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]; `build` validates.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            config: CircuitBreakerConfig {
                name: name.into(),
                failure_threshold: 5,
                failure_window_ms: 60_000,
                reset_timeout_ms: 30_000,
                success_threshold: 2,
                call_timeout_ms: 10_000,
                slow_call_threshold_ms: None,
            },
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window_ms = window.as_millis() as u64;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_threshold_ms = Some(threshold.as_millis() as u64);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Tuned defaults for common dependency kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerPreset {
    Database,
    PaymentGateway,
    ExternalApi,
    InternalService,
}

impl CircuitBreakerPreset {
    /// A builder for `name` seeded with this preset.
    pub fn builder(&self, name: impl Into<String>) -> CircuitBreakerConfigBuilder {
        let (failures, reset_secs, successes, timeout_ms, slow_ms) = match self {
            CircuitBreakerPreset::Database => (5, 30, 2, 5_000, 1_000),
            CircuitBreakerPreset::PaymentGateway => (3, 60, 3, 10_000, 3_000),
            CircuitBreakerPreset::ExternalApi => (5, 30, 2, 10_000, 5_000),
            CircuitBreakerPreset::InternalService => (10, 10, 3, 3_000, 1_000),
        };

        CircuitBreakerConfig::builder(name)
            .failure_threshold(failures)
            .failure_window(Duration::from_secs(60))
            .reset_timeout(Duration::from_secs(reset_secs))
            .success_threshold(successes)
            .call_timeout(Duration::from_millis(timeout_ms))
            .slow_call_threshold(Duration::from_millis(slow_ms))
    }

    /// This preset's config for `name`.
    pub fn config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        let builder = self.builder(name);
        builder.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_are_valid() {
        let config = CircuitBreakerConfig::builder("db").build().unwrap();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout(), Duration::from_secs(30));
        assert_eq!(config.slow_call_threshold(), None);
    }

    #[test]
    fn test_builder_rejects_zero_values() {
        let cases = [
            CircuitBreakerConfig::builder("x").failure_threshold(0),
            CircuitBreakerConfig::builder("x").success_threshold(0),
            CircuitBreakerConfig::builder("x").reset_timeout(Duration::ZERO),
            CircuitBreakerConfig::builder("x").call_timeout(Duration::ZERO),
            CircuitBreakerConfig::builder("x").failure_window(Duration::ZERO),
            CircuitBreakerConfig::builder(" "),
        ];
        for builder in cases {
            assert!(builder.build().is_err());
        }
    }

    #[test]
    fn test_parse_from_yaml() {
        let yaml = r#"
name: payments
failure_threshold: 3
failure_window_ms: 60000
reset_timeout_ms: 1000
success_threshold: 1
call_timeout_ms: 50
"#;
        let config: CircuitBreakerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_millis(50));
        assert!(config.slow_call_threshold_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in [
            CircuitBreakerPreset::Database,
            CircuitBreakerPreset::PaymentGateway,
            CircuitBreakerPreset::ExternalApi,
            CircuitBreakerPreset::InternalService,
        ] {
            let config = preset.config("dep");
            assert_eq!(config.name, "dep");
            assert!(config.validate().is_ok(), "{preset:?}");
        }

        let stripe = CircuitBreakerPreset::PaymentGateway
            .builder("stripe")
            .failure_threshold(2)
            .build()
            .unwrap();
        assert_eq!(stripe.failure_threshold, 2);
        assert_eq!(stripe.success_threshold, 3);
    }
}
