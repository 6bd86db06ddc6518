//! Counter store boundary and in-memory implementation.
//!
//! Every algorithm mutates per-key state through exactly one atomic
//! operation here: either a store-native increment-with-expiry (fixed
//! window) or a transactional read-transform-write (`check_and_set`) for
//! the algorithms that need a conditional update. A plain get-then-set
//! across two round trips is not acceptable: two concurrent callers could
//! both read `count = limit - 1` and both be admitted.
//!
//! [`MemoryStore`] serves single-instance deployments and all tests.
//! Multi-instance deployments implement [`CounterStore`] over a shared
//! atomic key-value store (e.g., scripted transactions) with the same
//! per-key serialization guarantee.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use crate::error::Result;

/// Algorithm-specific per-key counter state.
///
/// Bucket levels use fixed-point "milli" units (1 operation = 1000) so
/// refill and leak arithmetic stays exact under repeated accumulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum CounterState {
    /// Fixed window: hits in the current epoch-aligned window.
    Fixed { count: u64, window_start: u64 },
    /// Sliding window: admission timestamps (millis) within the trailing window.
    Sliding { timestamps: VecDeque<u64> },
    /// Token bucket: available capacity and the last refill time.
    Token { millitokens: u64, last_refill: u64 },
    /// Leaky bucket: current fill level and the last leak time.
    Leaky { millilevel: u64, last_leak: u64 },
}

/// Outcome of one atomic check-and-consume, as computed by the state
/// transform. The engine layer turns this into a full `RateLimitResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consume {
    pub allowed: bool,
    /// Attempts counted against the key, including this one.
    pub total_hits: u64,
    /// When the accounting period resets (unix millis).
    pub reset_at_millis: u64,
    /// How long a denied caller should wait before retrying.
    pub retry_after_millis: Option<u64>,
}

/// State transform executed atomically per key by `check_and_set`.
pub type StateTransform =
    Box<dyn FnOnce(Option<CounterState>) -> (CounterState, Consume) + Send>;

/// Boundary over wherever per-key counters are atomically stored.
///
/// Correctness under concurrency rests entirely on implementations
/// serializing operations per key: concurrent calls for the same key must
/// behave as if executed one at a time, with no lost updates. Different
/// keys are fully independent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key`, setting its expiry to
    /// `ttl` when this is the first hit. Returns the incremented value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Fetch the current state for `key`, if present and unexpired.
    async fn get_state(&self, key: &str) -> Result<Option<CounterState>>;

    /// Unconditionally replace the state for `key`.
    async fn set_state(&self, key: &str, state: CounterState, ttl: Duration) -> Result<()>;

    /// Atomically read the state at `key`, apply `transform`, and write the
    /// result back with the given `ttl`. No other operation on the same key
    /// may interleave.
    async fn check_and_set(
        &self,
        key: &str,
        ttl: Duration,
        transform: StateTransform,
    ) -> Result<Consume>;
}

#[derive(Debug, Clone)]
struct CountCell {
    count: u64,
    expires_at: u64,
}

#[derive(Debug, Clone)]
struct StateCell {
    state: CounterState,
    expires_at: u64,
}

/// Mutating operations between expired-entry sweeps.
const SWEEP_INTERVAL: u64 = 1024;

/// In-process counter store backed by a sharded concurrent map.
///
/// Per-key atomicity comes from the map's entry locking: an entry guard
/// holds its shard lock for the whole read-transform-write. Expiry is
/// lazy on reads, and every `SWEEP_INTERVAL` mutations a sweep drops all
/// expired cells, so keys that are never touched again (fixed-window keys
/// roll over every window) do not accumulate without bound.
pub struct MemoryStore {
    counts: DashMap<String, CountCell>,
    states: DashMap<String, StateCell>,
    clock: Arc<dyn Clock>,
    ops: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counts: DashMap::new(),
            states: DashMap::new(),
            clock,
            ops: AtomicU64::new(0),
        }
    }

    /// Number of entries not yet reaped (expired cells linger until the
    /// next sweep or access).
    pub fn entry_count(&self) -> usize {
        self.counts.len() + self.states.len()
    }

    /// Drop all counters. Primarily useful for tests.
    pub fn clear(&self) {
        self.counts.clear();
        self.states.clear();
    }

    /// Reap expired cells every `SWEEP_INTERVAL` mutations. Must not be
    /// called while holding an entry guard (retain takes shard locks).
    fn maybe_sweep(&self, now: u64) {
        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL != SWEEP_INTERVAL - 1 {
            return;
        }
        self.counts.retain(|_, cell| cell.expires_at > now);
        self.states.retain(|_, cell| cell.expires_at > now);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);
        let mut cell = self
            .counts
            .entry(key.to_string())
            .or_insert_with(|| CountCell {
                count: 0,
                expires_at: now + ttl.as_millis() as u64,
            });
        if cell.expires_at <= now {
            cell.count = 0;
            cell.expires_at = now + ttl.as_millis() as u64;
        }
        cell.count += 1;
        Ok(cell.count)
    }

    async fn get_state(&self, key: &str) -> Result<Option<CounterState>> {
        let now = self.clock.now_millis();
        self.states.remove_if(key, |_, cell| cell.expires_at <= now);
        Ok(self.states.get(key).map(|cell| cell.state.clone()))
    }

    async fn set_state(&self, key: &str, state: CounterState, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);
        self.states.insert(
            key.to_string(),
            StateCell {
                state,
                expires_at: now + ttl.as_millis() as u64,
            },
        );
        Ok(())
    }

    async fn check_and_set(
        &self,
        key: &str,
        ttl: Duration,
        transform: StateTransform,
    ) -> Result<Consume> {
        let now = self.clock.now_millis();
        self.maybe_sweep(now);
        // The entry guard holds the shard lock across the whole
        // read-transform-write, serializing operations on this key.
        let entry = self.states.entry(key.to_string());
        let current = match &entry {
            Entry::Occupied(occ) if occ.get().expires_at > now => Some(occ.get().state.clone()),
            _ => None,
        };
        let (next, outcome) = transform(current);
        entry.insert(StateCell {
            state: next,
            expires_at: now + ttl.as_millis() as u64,
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store_at(millis: u64) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(millis));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_increment_counts_up() {
        let (store, _clock) = store_at(1_000);
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);
        assert_eq!(store.increment("other", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_resets_after_expiry() {
        let (store, clock) = store_at(1_000);
        let ttl = Duration::from_secs(1);

        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        clock.advance(1_001);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_roundtrip_and_expiry() {
        let (store, clock) = store_at(1_000);
        let state = CounterState::Token {
            millitokens: 5_000,
            last_refill: 1_000,
        };

        store
            .set_state("k", state.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), Some(state));

        clock.advance(1_001);
        assert_eq!(store.get_state("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_and_set_sees_previous_state() {
        let (store, _clock) = store_at(1_000);
        let ttl = Duration::from_secs(60);

        let first = store
            .check_and_set(
                "k",
                ttl,
                Box::new(|prev| {
                    assert!(prev.is_none());
                    (
                        CounterState::Fixed {
                            count: 1,
                            window_start: 0,
                        },
                        Consume {
                            allowed: true,
                            total_hits: 1,
                            reset_at_millis: 61_000,
                            retry_after_millis: None,
                        },
                    )
                }),
            )
            .await
            .unwrap();
        assert!(first.allowed);

        let second = store
            .check_and_set(
                "k",
                ttl,
                Box::new(|prev| {
                    let count = match prev {
                        Some(CounterState::Fixed { count, .. }) => count + 1,
                        _ => panic!("expected fixed state"),
                    };
                    (
                        CounterState::Fixed {
                            count,
                            window_start: 0,
                        },
                        Consume {
                            allowed: true,
                            total_hits: count,
                            reset_at_millis: 61_000,
                            retry_after_millis: None,
                        },
                    )
                }),
            )
            .await
            .unwrap();
        assert_eq!(second.total_hits, 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_no_updates() {
        let store = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(60);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("k", ttl).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.increment("k", ttl).await.unwrap(), 65);
    }

    #[tokio::test]
    async fn test_clear_drops_entries() {
        let (store, _clock) = store_at(1_000);
        store.increment("a", Duration::from_secs(1)).await.unwrap();
        store
            .set_state(
                "b",
                CounterState::Leaky {
                    millilevel: 0,
                    last_leak: 1_000,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(store.entry_count(), 2);

        store.clear();
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_window_counters_are_reaped() {
        let (store, clock) = store_at(0);
        let ttl = Duration::from_secs(1);

        // One fresh key per one-second window, as the fixed-window engine
        // produces. Entries must not pile up across windows.
        for window in 0u64..10_000 {
            let key = format!("k:{}", window * 1_000);
            store.increment(&key, ttl).await.unwrap();
            clock.advance(1_000);
        }

        assert!(
            store.entry_count() < 2 * SWEEP_INTERVAL as usize,
            "expired entries accumulated: {}",
            store.entry_count()
        );
    }

    #[tokio::test]
    async fn test_counter_state_serializes() {
        let state = CounterState::Sliding {
            timestamps: VecDeque::from(vec![1_000, 2_000]),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: CounterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
