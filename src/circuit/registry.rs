//! Named circuit breakers and registry-wide event fan-out.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
use super::config::CircuitBreakerConfig;
use super::events::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Creates and holds circuit breakers by name.
///
/// Every breaker created here forwards its events to the registry's own
/// [`EventBus`] as well as to its per-breaker listeners.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a registry whose breakers read `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            events: Arc::new(EventBus::new()),
            clock,
        }
    }

    /// Build a registry holding a breaker for every config.
    pub fn from_configs(configs: &[CircuitBreakerConfig]) -> Result<Self> {
        let registry = Self::new();
        for config in configs {
            registry.get_or_create(config.clone())?;
        }
        Ok(registry)
    }

    /// Listeners receiving events from every breaker.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Return the breaker named `config.name`, creating it if needed.
    ///
    /// The first config registered under a name wins; later configs for the
    /// same name are ignored.
    pub fn get_or_create(&self, config: CircuitBreakerConfig) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(&config.name) {
            return Ok(existing.value().clone());
        }

        let name = config.name.clone();
        let entry = self.breakers.entry(name).or_try_insert_with(|| {
            let breaker =
                CircuitBreaker::build(config, self.clock.clone(), Some(self.events.clone()))?;
            info!(
                circuit = %breaker.name(),
                failure_threshold = breaker.config().failure_threshold,
                reset_timeout_ms = breaker.config().reset_timeout_ms,
                "Created circuit breaker"
            );
            Ok::<_, crate::error::RampartError>(Arc::new(breaker))
        })?;
        Ok(entry.value().clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, breaker)| breaker)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics for every breaker, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitMetrics> {
        let mut metrics: Vec<CircuitMetrics> =
            self.breakers.iter().map(|e| e.value().metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Names of breakers not currently closed, sorted.
    pub fn unhealthy_circuits(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().state() != CircuitState::Closed)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
