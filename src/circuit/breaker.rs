//! Circuit breaker state machine.
//!
//! # States
//! - Closed: calls pass through; failures inside the failure window are kept
//! - Open: calls fail fast with [`CircuitOpenError`]
//! - Half-Open: calls pass through as probes
//!
//! # Transitions
//! ```text
//! Closed    -> Open:      failures within window >= failure_threshold
//! Open      -> Half-Open: first call after reset_timeout
//! Half-Open -> Closed:    consecutive successes >= success_threshold
//! Half-Open -> Open:      any failure
//! ```

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

use super::config::CircuitBreakerConfig;
use super::events::{CircuitEvent, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// A call was rejected because the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit_name}' is open, retry in {remaining_ms}ms")]
pub struct CircuitOpenError {
    pub circuit_name: String,
    /// Time until the breaker lets a probe through
    pub remaining_ms: u64,
}

impl CircuitOpenError {
    pub fn remaining_time(&self) -> Duration {
        Duration::from_millis(self.remaining_ms)
    }
}

/// Failure of a call made through [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The operation was not invoked
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The operation did not finish within the call timeout
    #[error("circuit '{circuit_name}' call timed out after {timeout:?}")]
    Timeout {
        circuit_name: String,
        timeout: Duration,
    },

    /// The operation's own error, unchanged
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }

    /// The operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(err) => Some(err),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub rejected_calls: u64,
    pub timed_out_calls: u64,
    pub state_changes: u64,
    /// Failures currently inside the failure window
    pub recent_failures: usize,
    pub half_open_successes: u32,
    pub average_response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<u64>,
    pub last_state_change: u64,
    pub time_in_current_state_ms: u64,
}

#[derive(Debug, Default, Clone)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    slow: u64,
    rejected: u64,
    timed_out: u64,
    state_changes: u64,
    completed_duration_ms: u64,
}

#[derive(Debug)]
struct Transition {
    previous: CircuitState,
    next: CircuitState,
    at: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<u64>,
    half_open_successes: u32,
    state_changed_at: u64,
    last_failure_time: Option<u64>,
    counters: Counters,
}

impl BreakerInner {
    fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            state_changed_at: now,
            last_failure_time: None,
            counters: Counters::default(),
        }
    }

    fn transition(&mut self, next: CircuitState, now: u64) -> Option<Transition> {
        if self.state == next {
            return None;
        }
        let previous = self.state;
        self.state = next;
        self.state_changed_at = now;
        self.half_open_successes = 0;
        if next == CircuitState::Closed {
            self.failures.clear();
        }
        self.counters.state_changes += 1;
        Some(Transition {
            previous,
            next,
            at: now,
        })
    }

    fn prune_failures(&mut self, now: u64, window_ms: u64) {
        while self
            .failures
            .front()
            .is_some_and(|&at| now.saturating_sub(at) >= window_ms)
        {
            self.failures.pop_front();
        }
    }
}

/// Outcome of asking the breaker for permission to call.
enum Admission {
    Allowed(Option<Transition>),
    Rejected { remaining_ms: u64 },
}

/// Guards one dependency.
///
/// All mutation happens through [`execute`](Self::execute),
/// [`force_state`](Self::force_state) and [`reset`](Self::reset). The internal
/// lock is never held across an `.await`.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: EventBus,
    upstream: Option<Arc<EventBus>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker reading wall-clock time.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, clock, None)
    }

    pub(crate) fn build(
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        upstream: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        config.validate()?;
        let now = clock.now_ms();
        Ok(Self {
            config,
            inner: Mutex::new(BreakerInner::new(now)),
            events: EventBus::new(),
            upstream,
            clock,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// This breaker's own listeners.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejects without invoking `operation` while open. Otherwise the call is
    /// raced against the call timeout; a timeout counts as a failure. On
    /// timeout the operation's future is dropped, so any work it handed off
    /// elsewhere must be cleaned up by the caller.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        self.admit()?;

        let timeout = self.config.call_timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, operation()).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(elapsed);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure(elapsed, err.to_string(), false);
                Err(BreakerError::Operation(err))
            }
            Err(_) => {
                self.record_failure(elapsed, format!("timed out after {timeout:?}"), true);
                Err(BreakerError::Timeout {
                    circuit_name: self.config.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Snapshot of the breaker's counters.
    pub fn metrics(&self) -> CircuitMetrics {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        let counters = &inner.counters;
        let completed = counters.successful + counters.failed;
        let window = self.config.failure_window_ms;

        CircuitMetrics {
            name: self.config.name.clone(),
            state: inner.state,
            total_calls: counters.total,
            successful_calls: counters.successful,
            failed_calls: counters.failed,
            slow_calls: counters.slow,
            rejected_calls: counters.rejected,
            timed_out_calls: counters.timed_out,
            state_changes: counters.state_changes,
            recent_failures: inner
                .failures
                .iter()
                .filter(|&&at| now.saturating_sub(at) < window)
                .count(),
            half_open_successes: inner.half_open_successes,
            average_response_time_ms: counters
                .completed_duration_ms
                .checked_div(completed)
                .unwrap_or(0),
            last_failure_time: inner.last_failure_time,
            last_state_change: inner.state_changed_at,
            time_in_current_state_ms: now.saturating_sub(inner.state_changed_at),
        }
    }

    /// Move to `state` immediately, bypassing the normal triggers.
    pub fn force_state(&self, state: CircuitState) {
        let now = self.clock.now_ms();
        let transition = self.inner.lock().transition(state, now);
        if let Some(transition) = transition {
            info!(circuit = %self.config.name, state = %state, "Circuit state forced");
            self.announce(transition);
        }
    }

    /// Return to a fresh closed breaker with zeroed metrics. Emits nothing.
    pub fn reset(&self) {
        let now = self.clock.now_ms();
        *self.inner.lock() = BreakerInner::new(now);
        debug!(circuit = %self.config.name, "Circuit reset");
    }

    fn admit(&self) -> std::result::Result<(), CircuitOpenError> {
        let now = self.clock.now_ms();
        let admission = {
            let mut inner = self.inner.lock();
            inner.counters.total += 1;

            if inner.state != CircuitState::Open {
                Admission::Allowed(None)
            } else {
                let open_for = now.saturating_sub(inner.state_changed_at);
                if open_for >= self.config.reset_timeout_ms {
                    Admission::Allowed(inner.transition(CircuitState::HalfOpen, now))
                } else {
                    inner.counters.rejected += 1;
                    Admission::Rejected {
                        remaining_ms: self.config.reset_timeout_ms - open_for,
                    }
                }
            }
        };

        match admission {
            Admission::Allowed(transition) => {
                if let Some(transition) = transition {
                    self.announce(transition);
                }
                trace!(circuit = %self.config.name, "Call admitted");
                Ok(())
            }
            Admission::Rejected { remaining_ms } => {
                debug!(
                    circuit = %self.config.name,
                    remaining_ms,
                    "Circuit open, rejecting call"
                );
                self.emit(CircuitEvent::CallRejected {
                    circuit_name: self.config.name.clone(),
                    remaining_ms,
                    timestamp: now,
                });
                Err(CircuitOpenError {
                    circuit_name: self.config.name.clone(),
                    remaining_ms,
                })
            }
        }
    }

    fn record_success(&self, elapsed: Duration) {
        let now = self.clock.now_ms();
        let duration_ms = elapsed.as_millis() as u64;
        let slow = self
            .config
            .slow_call_threshold()
            .is_some_and(|threshold| elapsed > threshold);

        let transition = {
            let mut inner = self.inner.lock();
            inner.counters.successful += 1;
            inner.counters.completed_duration_ms += duration_ms;
            if slow {
                inner.counters.slow += 1;
            }

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed, now)
                } else {
                    None
                }
            } else {
                None
            }
        };

        if slow {
            debug!(circuit = %self.config.name, duration_ms, "Slow call");
        }
        self.emit(CircuitEvent::CallSuccess {
            circuit_name: self.config.name.clone(),
            duration_ms,
            slow,
            timestamp: now,
        });
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn record_failure(&self, elapsed: Duration, error: String, timed_out: bool) {
        let now = self.clock.now_ms();
        let duration_ms = elapsed.as_millis() as u64;

        let transition = {
            let mut inner = self.inner.lock();
            inner.counters.failed += 1;
            inner.counters.completed_duration_ms += duration_ms;
            if timed_out {
                inner.counters.timed_out += 1;
            }
            inner.last_failure_time = Some(now);

            match inner.state {
                CircuitState::Closed => {
                    inner.prune_failures(now, self.config.failure_window_ms);
                    inner.failures.push_back(now);
                    if inner.failures.len() >= self.config.failure_threshold as usize {
                        inner.transition(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => inner.transition(CircuitState::Open, now),
                // Admitted before a concurrent probe reopened the circuit.
                CircuitState::Open => None,
            }
        };

        debug!(
            circuit = %self.config.name,
            duration_ms,
            timed_out,
            error = %error,
            "Call failed"
        );
        self.emit(CircuitEvent::CallFailure {
            circuit_name: self.config.name.clone(),
            duration_ms,
            timed_out,
            error,
            timestamp: now,
        });
        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn announce(&self, transition: Transition) {
        info!(
            circuit = %self.config.name,
            from = %transition.previous,
            to = %transition.next,
            "Circuit state changed"
        );
        self.emit(CircuitEvent::StateChange {
            circuit_name: self.config.name.clone(),
            previous_state: transition.previous,
            new_state: transition.next,
            timestamp: transition.at,
        });
    }

    fn emit(&self, event: CircuitEvent) {
        self.events.emit(&event);
        if let Some(upstream) = &self.upstream {
            upstream.emit(&event);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
