//! Pluggable key/state storage for rate limiters.
//!
//! [`RateLimitStore`] is the seam between the limiter algorithms and wherever
//! their counters live. [`MemoryStore`] is the in-process default; a deployment
//! running more than one instance supplies a networked implementation whose
//! `increment` is atomic on the backing store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Per-key rate limit state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    /// Requests counted against this key
    pub count: u64,
    /// Start of the window this state belongs to (unix ms)
    pub window_start: u64,
    /// Available tokens (token bucket only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Last time tokens were credited (token bucket only, unix ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refill: Option<u64>,
}

/// Storage backend used by rate limiters.
///
/// Every entry carries a time-to-live; expired entries must read as absent.
/// Atomicity of [`increment`](Self::increment) is the implementation's
/// responsibility: two racing increments may observe the same count unless the
/// backend serializes per-key access.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetch the state stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError>;

    /// Replace the state stored under `key`.
    async fn set(&self, key: &str, state: RateLimitState, ttl: Duration) -> Result<(), StoreError>;

    /// Increment the count under `key`, creating it with `ttl` if absent.
    ///
    /// Returns the count after the increment.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Fetch several keys at once, preserving order.
    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<RateLimitState>>, StoreError> {
        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            states.push(self.get(key).await?);
        }
        Ok(states)
    }

    /// Remove the state stored under `key`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    state: RateLimitState,
    expires_at: u64,
}

/// In-process store backed by a [`DashMap`].
///
/// Per-key operations run under the map's shard lock, so `increment` is
/// atomic within a single process.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store reading wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, including expired entries not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired rate limit entries");
        }
        removed
    }

    /// Periodically purge expired entries on the tokio runtime.
    ///
    /// The task ends once the store is dropped. Reads never depend on it.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }

    fn expiry(&self, now: u64, ttl: Duration) -> u64 {
        now.saturating_add(ttl.as_millis() as u64)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError> {
        let now = self.clock.now_ms();
        let state = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.state.clone());
        Ok(state)
    }

    async fn set(&self, key: &str, state: RateLimitState, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.expiry(self.clock.now_ms(), ttl);
        self.entries
            .insert(key.to_string(), StoredEntry { state, expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let expires_at = self.expiry(now, ttl);

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                state: RateLimitState {
                    window_start: now,
                    ..Default::default()
                },
                expires_at,
            });

        if entry.expires_at <= now {
            *entry = StoredEntry {
                state: RateLimitState {
                    window_start: now,
                    ..Default::default()
                },
                expires_at,
            };
        }

        entry.state.count = entry.state.count.saturating_add(1);
        trace!(key, count = entry.state.count, "Incremented rate limit counter");
        Ok(entry.state.count)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
