//! Circuit breakers and their registry.

mod breaker;
mod config;
mod events;
mod registry;

pub use breaker::{BreakerError, CircuitBreaker, CircuitMetrics, CircuitOpenError, CircuitState};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerPreset};
pub use events::{CircuitEvent, EventBus, ListenerHandle, DEFAULT_LISTENER_CAPACITY};
pub use registry::CircuitBreakerRegistry;
