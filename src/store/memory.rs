//! In-process window store.
//!
//! Holds every key's log in a sharded map. Evaluation runs while the shard
//! lock for the key is held, which gives the same indivisibility the Redis
//! script gets from Redis' single-threaded execution, but only within one
//! process. Suitable for single-node deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::ratelimit::{RateLimitKey, WindowLog, WindowOutcome, WindowStore};

/// Evaluations between sweeps of abandoned keys.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Default)]
struct Slot {
    log: WindowLog,
    window_millis: u64,
}

/// Window store backed by process memory.
#[derive(Debug)]
pub struct MemoryWindowStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    evaluations: AtomicU64,
}

impl MemoryWindowStore {
    /// Create a store that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            evaluations: AtomicU64::new(0),
        }
    }

    /// Drop keys whose entries have all left their window.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.log.is_expired(now, slot.window_millis));
        before.saturating_sub(self.slots.len())
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }

    /// Entries held for a key, including any not yet pruned.
    pub fn entry_count(&self, key: &RateLimitKey) -> usize {
        self.slots
            .get(key.as_str())
            .map(|slot| slot.log.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn evaluate_window(
        &self,
        key: &RateLimitKey,
        window_millis: u64,
        max_requests: u32,
    ) -> Result<WindowOutcome, StoreError> {
        let outcome = {
            let mut slot = self.slots.entry(key.as_str().to_string()).or_default();
            let now = self.clock.now_millis();
            slot.window_millis = window_millis;
            slot.log.evaluate(now, window_millis, max_requests)
        };

        trace!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Evaluated in-memory window"
        );

        if self.evaluations.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            trace!(purged = purged, "Swept expired in-memory windows");
        }

        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::{AdmissionRequest, FailureMode, KeyBuilder, KeyStrategy, RateLimitPolicy};
    use http::Method;

    fn key(ip: &str) -> RateLimitKey {
        let policy =
            RateLimitPolicy::new("p", 1000, 3, KeyStrategy::Ip, FailureMode::Open).unwrap();
        let request = AdmissionRequest::new("/api", Method::GET).with_peer_ip(ip.parse().unwrap());
        KeyBuilder::default().build_key(&request, &policy)
    }

    #[tokio::test]
    async fn test_store_uses_its_own_clock() {
        let clock = Arc::new(MockClock::new(5_000));
        let store = MemoryWindowStore::with_clock(clock.clone());

        let outcome = store.evaluate_window(&key("10.0.0.1"), 1000, 3).await.unwrap();
        assert_eq!(outcome.now_millis, 5_000);
        assert_eq!(outcome.oldest_millis, Some(5_000));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = Arc::new(MockClock::new(0));
        let store = MemoryWindowStore::with_clock(clock);
        let a = key("10.0.0.1");
        let b = key("10.0.0.2");

        for _ in 0..3 {
            assert!(store.evaluate_window(&a, 1000, 3).await.unwrap().allowed);
        }
        assert!(!store.evaluate_window(&a, 1000, 3).await.unwrap().allowed);

        let other = store.evaluate_window(&b, 1000, 3).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 2);
    }

    #[tokio::test]
    async fn test_purge_expired_drops_abandoned_keys() {
        let clock = Arc::new(MockClock::new(0));
        let store = MemoryWindowStore::with_clock(clock.clone());
        store.evaluate_window(&key("10.0.0.1"), 1000, 3).await.unwrap();
        store.evaluate_window(&key("10.0.0.2"), 5000, 3).await.unwrap();

        clock.set(2_000);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.entry_count(&key("10.0.0.2")), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluations_never_exceed_limit() {
        let clock = Arc::new(MockClock::new(0));
        let store = Arc::new(MemoryWindowStore::with_clock(clock));
        let k = key("10.0.0.1");

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = Arc::clone(&store);
                let k = k.clone();
                tokio::spawn(async move { store.evaluate_window(&k, 1000, 10).await.unwrap() })
            })
            .collect();

        let outcomes = futures::future::join_all(tasks).await;
        let admitted = outcomes
            .into_iter()
            .filter(|o| o.as_ref().unwrap().allowed)
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_race_at_last_slot_admits_exactly_one() {
        for round in 0..50u64 {
            let clock = Arc::new(MockClock::new(round * 10_000));
            let store = Arc::new(MemoryWindowStore::with_clock(clock));
            let k = key("10.0.0.1");

            for _ in 0..2 {
                assert!(store.evaluate_window(&k, 1000, 3).await.unwrap().allowed);
            }

            let (a, b) = tokio::join!(
                tokio::spawn({
                    let store = Arc::clone(&store);
                    let k = k.clone();
                    async move { store.evaluate_window(&k, 1000, 3).await.unwrap() }
                }),
                tokio::spawn({
                    let store = Arc::clone(&store);
                    let k = k.clone();
                    async move { store.evaluate_window(&k, 1000, 3).await.unwrap() }
                }),
            );
            let allowed = [a.unwrap().allowed, b.unwrap().allowed];
            assert_eq!(allowed.iter().filter(|&&x| x).count(), 1, "round {}", round);
        }
    }
}
