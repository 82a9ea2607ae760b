//! Per-key rate-limit state and the storage seam behind it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::{Algorithm, Limits};

/// Identifies one partition of one config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub config_id: String,
    pub key: String,
}

impl StateKey {
    pub fn new(config_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self { config_id: config_id.into(), key: key.into() }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.config_id, self.key)
    }
}

/// Algorithm state for one `(config, key)` pair.
///
/// Only the fields of the config's algorithm are meaningful; the rest stay at their
/// initial values.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    /// Token bucket: tokens currently available
    pub tokens: f64,
    /// Leaky bucket: current fill level
    pub level: f64,
    /// Token/leaky bucket: clock time of the last refill or drain
    pub last_refill: u64,
    /// Sliding window: admitted request times, oldest first
    pub timestamps: VecDeque<u64>,
    /// Fixed window: requests admitted in the current window
    pub count: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RateLimitState {
    /// Fresh state: a full token bucket, an empty leaky bucket, an empty window.
    pub fn new(algorithm: Algorithm, limits: &Limits, now: u64) -> Self {
        let tokens = match algorithm {
            Algorithm::TokenBucket => limits.capacity() as f64,
            _ => 0.0,
        };
        let window_start = match algorithm {
            Algorithm::FixedWindow => now - now % limits.window_ms().max(1),
            _ => now,
        };
        Self {
            tokens,
            level: 0.0,
            last_refill: now,
            timestamps: VecDeque::new(),
            count: 0,
            window_start,
            window_end: window_start.saturating_add(limits.window_ms()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage for per-key state.
///
/// `update` must run `apply` with exclusive access to the state of `key`: two
/// concurrent checks on the same key never observe the same pre-state. Different keys
/// may proceed in parallel.
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Run `apply` on the state under `key`, creating it with `init` first if absent.
    fn update(
        &self,
        key: &StateKey,
        init: &dyn Fn() -> RateLimitState,
        apply: &mut dyn FnMut(&mut RateLimitState),
    );

    /// Copy of the state under `key`.
    fn get(&self, key: &StateKey) -> Option<RateLimitState>;

    fn remove(&self, key: &StateKey) -> bool;

    /// Drop every entry for which `keep` returns false; returns how many were dropped.
    fn retain(&self, keep: &mut dyn FnMut(&StateKey, &RateLimitState) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Slot = Arc<Mutex<RateLimitState>>;

/// Process-local store with one lock per key.
///
/// The map lock is held only to find or insert a slot; the algorithm runs under the
/// slot's own mutex.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    slots: RwLock<HashMap<StateKey, Slot>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &StateKey, init: &dyn Fn() -> RateLimitState) -> Slot {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return slot.clone();
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(init()))).clone()
    }
}

impl StateStore for InMemoryStateStore {
    fn update(
        &self,
        key: &StateKey,
        init: &dyn Fn() -> RateLimitState,
        apply: &mut dyn FnMut(&mut RateLimitState),
    ) {
        let slot = self.slot(key, init);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state);
    }

    fn get(&self, key: &StateKey) -> Option<RateLimitState> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn remove(&self, key: &StateKey) -> bool {
        self.slots.write().unwrap_or_else(PoisonError::into_inner).remove(key).is_some()
    }

    fn retain(&self, keep: &mut dyn FnMut(&StateKey, &RateLimitState) -> bool) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<StateKey> = slots
            .iter()
            .filter(|(key, slot)| {
                let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                !keep(key, &state)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            slots.remove(key);
        }
        doomed.len()
    }

    fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn init() -> RateLimitState {
        RateLimitState::new(Algorithm::FixedWindow, &Limits::new(10, 1), 0)
    }

    #[test]
    fn new_state_matches_algorithm() {
        let limits = Limits::new(10, 60).with_burst(15);
        let bucket = RateLimitState::new(Algorithm::TokenBucket, &limits, 5);
        assert_eq!(bucket.tokens, 15.0);
        assert_eq!(bucket.last_refill, 5);

        let fixed = RateLimitState::new(Algorithm::FixedWindow, &limits, 61_500);
        assert_eq!(fixed.window_start, 60_000);
        assert_eq!(fixed.window_end, 120_000);

        let leaky = RateLimitState::new(Algorithm::LeakyBucket, &limits, 0);
        assert_eq!(leaky.level, 0.0);
    }

    #[test]
    fn update_creates_then_mutates() {
        let store = InMemoryStateStore::new();
        let key = StateKey::new("c", "k");
        store.update(&key, &init, &mut |s| s.count += 1);
        store.update(&key, &init, &mut |s| s.count += 1);
        assert_eq!(store.get(&key).unwrap().count, 2);
        assert_eq!(key.to_string(), "c:k");
    }

    #[test]
    fn retain_reports_dropped_entries() {
        let store = InMemoryStateStore::new();
        for i in 0..4u64 {
            store.update(&StateKey::new("c", i.to_string()), &init, &mut |s| s.count = i);
        }
        let dropped = store.retain(&mut |_, s| s.count % 2 == 0);
        assert_eq!(dropped, 2);
        assert_eq!(store.len(), 2);
        assert!(store.remove(&StateKey::new("c", "0")));
        assert!(!store.remove(&StateKey::new("c", "0")));
    }

    #[test]
    fn concurrent_updates_on_one_key_are_serialized() {
        let store = Arc::new(InMemoryStateStore::new());
        let key = StateKey::new("c", "hot");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.update(&key, &init, &mut |s| s.count += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&key).unwrap().count, 2000);
    }
}
