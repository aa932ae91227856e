//! Configuration management for Rampart.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::{RampartError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimiterRegistry};

/// Prefix for environment overrides, e.g. `RAMPART__LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "RAMPART";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampartConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Circuit breakers created at startup
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerConfig>,

    /// Rate limit rules registered at startup
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RampartConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RampartError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RampartConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RampartConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RampartError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every breaker and rule, and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for breaker in &self.circuit_breakers {
            breaker.validate()?;
            if !seen.insert(breaker.name.as_str()) {
                return Err(RampartError::invalid(&breaker.name, "name", "is defined twice"));
            }
        }

        let mut seen = HashSet::new();
        for rule in &self.rate_limits {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(RampartError::invalid(&rule.name, "name", "is defined twice"));
            }
        }
        Ok(())
    }

    /// A breaker registry holding every configured breaker.
    pub fn circuit_breaker_registry(&self) -> Result<CircuitBreakerRegistry> {
        CircuitBreakerRegistry::from_configs(&self.circuit_breakers)
    }

    /// A limiter registry holding every configured rule.
    pub fn rate_limiter_registry(&self) -> Result<RateLimiterRegistry> {
        RateLimiterRegistry::from_configs(&self.rate_limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, Scope};

    const YAML: &str = r#"
logging:
  level: debug
circuit_breakers:
  - name: postgres
    failure_threshold: 5
    failure_window_ms: 60000
    reset_timeout_ms: 30000
    success_threshold: 2
    call_timeout_ms: 5000
    slow_call_threshold_ms: 1000
rate_limits:
  - name: login
    max_requests: 5
    window_ms: 300000
    algorithm: fixed_window
    scope: composite
  - name: public_api
    max_requests: 100
    window_ms: 60000
    algorithm: token_bucket
    scope: api_key
    burst_size: 20
"#;

    #[test]
    fn test_parse_full_config() {
        let config = RampartConfig::from_yaml(YAML).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
        assert_eq!(config.circuit_breakers.len(), 1);
        assert_eq!(config.rate_limits[1].algorithm, Algorithm::TokenBucket);
        assert_eq!(config.rate_limits[1].scope, Scope::ApiKey);
        assert_eq!(config.rate_limits[1].burst_size(), 20);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = RampartConfig::from_yaml("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.circuit_breakers.is_empty());
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn test_rejects_invalid_and_duplicate_entries() {
        let invalid = r#"
rate_limits:
  - name: broken
    max_requests: 0
    window_ms: 1000
"#;
        assert!(RampartConfig::from_yaml(invalid).is_err());

        let duplicate = r#"
rate_limits:
  - name: api
    max_requests: 1
    window_ms: 1000
  - name: api
    max_requests: 2
    window_ms: 1000
"#;
        let err = RampartConfig::from_yaml(duplicate).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("rampart-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, YAML).unwrap();

        let config = RampartConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.circuit_breakers[0].name, "postgres");
        assert_eq!(config.circuit_breakers[0].slow_call_threshold_ms, Some(1000));
        assert_eq!(config.rate_limits.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let err = RampartConfig::from_file("/nonexistent/rampart.yaml").unwrap_err();
        assert!(matches!(err, RampartError::Io(_)));
    }

    #[tokio::test]
    async fn test_builds_registries() {
        let config = RampartConfig::from_yaml(YAML).unwrap();

        let breakers = config.circuit_breaker_registry().unwrap();
        assert_eq!(breakers.names(), vec!["postgres"]);

        let limiters = config.rate_limiter_registry().unwrap();
        assert_eq!(limiters.names(), vec!["login", "public_api"]);
    }
}
