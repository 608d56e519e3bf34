//! Memoization fabric: bounded LRU caches with single-flight computation.
//!
//! ```text
//!   caller A ──┐                 ┌────────────┐
//!   caller B ──┼─► slot_for(key) │  LruState  │  map lock: held only to find
//!   caller C ──┘        │        └────────────┘  or create the key's slot
//!                       ▼
//!                ┌─────────────┐
//!                │ Slot (key)  │  slot lock: held for the whole computation,
//!                └─────────────┘  late callers block here, then read the value
//! ```
//!
//! A slot is either empty or holds a complete value. Failed computations
//! leave it empty and drop it from the map, so errors are never cached.
//! Eviction only removes slots holding a complete value; while every entry
//! is in flight the cache runs over capacity and shrinks back as they finish.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

type Slot<V> = Mutex<Option<Arc<V>>>;

struct Entry<V> {
    slot: Arc<Slot<V>>,
    tick: u64,
}

/// Recency bookkeeping: `order` maps last-use tick → key.
struct LruState<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
    tick: u64,
}

/// Counters exposed for instrumentation and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    /// Number of times the compute function actually ran.
    pub computations: u64,
    pub failures: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// A named, bounded cache owning both the stored values and the per-key
/// single-flight locks.
pub struct MemoCache<K, V> {
    name: &'static str,
    capacity: usize,
    state: Mutex<LruState<K, V>>,
    hits: AtomicU64,
    computations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A capacity of 0 is treated as 1.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        MemoCache {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Return the cached value for `key`, or run `compute` exactly once
    /// across all concurrent callers asking for the same key.
    pub fn get_or_compute<E, F>(&self, key: K, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot_for(&key);
        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(value));
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        match compute() {
            Ok(value) => {
                let value = Arc::new(value);
                *guard = Some(Arc::clone(&value));
                drop(guard);
                let mut state = self.state.lock();
                self.evict_completed(&mut state, self.capacity);
                Ok(value)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                self.forget(&key, &slot);
                Err(err)
            }
        }
    }

    /// Cached value without computing or touching recency.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let slot = {
            let state = self.state.lock();
            Arc::clone(&state.entries.get(key)?.slot)
        };
        let value = slot.try_lock()?.clone();
        value
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Computations in flight finish but are not stored.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }

    /// Find or create the slot for `key`, marking it most recently used and
    /// evicting the least recently used entry when over capacity.
    fn slot_for(&self, key: &K) -> Arc<Slot<V>> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.entries.get_mut(key) {
            let previous = std::mem::replace(&mut entry.tick, tick);
            let slot = Arc::clone(&entry.slot);
            state.order.remove(&previous);
            state.order.insert(tick, key.clone());
            return slot;
        }

        self.evict_completed(&mut state, self.capacity - 1);

        let slot: Arc<Slot<V>> = Arc::new(Mutex::new(None));
        state.entries.insert(
            key.clone(),
            Entry {
                slot: Arc::clone(&slot),
                tick,
            },
        );
        state.order.insert(tick, key.clone());
        slot
    }

    /// Evict least recently used entries until at most `limit` remain.
    /// Empty slots are being computed (or about to be) and are skipped.
    fn evict_completed(&self, state: &mut LruState<K, V>, limit: usize) {
        let mut excess = state.entries.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        let mut victims = Vec::new();
        for (tick, key) in &state.order {
            if excess == 0 {
                break;
            }
            let Some(entry) = state.entries.get(key) else {
                continue;
            };
            if entry.slot.try_lock().is_some_and(|value| value.is_some()) {
                victims.push((*tick, key.clone()));
                excess -= 1;
            }
        }
        for (tick, key) in victims {
            state.order.remove(&tick);
            state.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("cache '{}': evicted least recently used entry", self.name);
        }
    }

    /// Remove `key` if it still maps to `slot` and the slot is empty.
    fn forget(&self, key: &K, slot: &Arc<Slot<V>>) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(key) else {
            return;
        };
        if !Arc::ptr_eq(&entry.slot, slot) {
            return;
        }
        // Another caller may have retried and succeeded in the meantime.
        if slot.try_lock().is_some_and(|value| value.is_some()) {
            return;
        }
        let tick = entry.tick;
        state.entries.remove(key);
        state.order.remove(&tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn computes_once_and_then_hits() {
        let cache: MemoCache<u32, String> = MemoCache::new("test", 4);
        let first = cache
            .get_or_compute(7, || Ok::<_, ()>("seven".to_string()))
            .unwrap();
        let second = cache
            .get_or_compute(7, || -> Result<String, ()> { panic!("must not recompute") })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats();
        assert_eq!(stats.computations, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn concurrent_identical_requests_compute_once() {
        const CALLERS: usize = 12;
        let cache: MemoCache<&'static str, u64> = MemoCache::new("flight", 4);
        let runs = AtomicU64::new(0);
        let barrier = Barrier::new(CALLERS);

        let results: Vec<Arc<u64>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache
                            .get_or_compute("key", || {
                                runs.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(50));
                                Ok::<_, ()>(42)
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|v| **v == 42));
        assert_eq!(cache.stats().computations, 1);
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let cache: MemoCache<u32, u32> = MemoCache::new("keys", 8);
        let barrier = Barrier::new(2);
        // Each computation waits for the other one to start; this deadlocks
        // if distinct keys share a lock.
        thread::scope(|scope| {
            for key in 0..2 {
                let cache = &cache;
                let barrier = &barrier;
                scope.spawn(move || {
                    cache
                        .get_or_compute(key, || {
                            barrier.wait();
                            Ok::<_, ()>(key)
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(cache.stats().computations, 2);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache: MemoCache<u32, u32> = MemoCache::new("lru", 2);
        let compute = |v: u32| move || Ok::<_, ()>(v * 10);
        cache.get_or_compute(1, compute(1)).unwrap();
        cache.get_or_compute(2, compute(2)).unwrap();
        // Touch 1 so 2 becomes the oldest.
        cache.get_or_compute(1, compute(1)).unwrap();
        cache.get_or_compute(3, compute(3)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&1).is_some());
        assert!(cache.peek(&2).is_none());
        assert!(cache.peek(&3).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn running_computation_is_never_evicted() {
        let cache: MemoCache<u32, u32> = MemoCache::new("busy", 2);
        let started = Barrier::new(2);
        let release = Barrier::new(2);

        thread::scope(|scope| {
            scope.spawn(|| {
                cache
                    .get_or_compute(1, || {
                        started.wait();
                        release.wait();
                        Ok::<_, ()>(10)
                    })
                    .unwrap();
            });

            started.wait();
            // Key 1 is still computing, so these two push out key 2 instead.
            cache.get_or_compute(2, || Ok::<_, ()>(20)).unwrap();
            cache.get_or_compute(3, || Ok::<_, ()>(30)).unwrap();
            release.wait();

            let value = cache
                .get_or_compute(1, || -> Result<u32, ()> { panic!("computed twice") })
                .unwrap();
            assert_eq!(*value, 10);
        });

        let stats = cache.stats();
        assert_eq!(stats.computations, 3);
        assert_eq!(stats.evictions, 1);
        assert!(cache.peek(&2).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn shrinks_back_once_in_flight_entries_finish() {
        let cache: MemoCache<u32, u32> = MemoCache::new("over", 1);
        let started = Barrier::new(2);
        let release = Barrier::new(2);

        thread::scope(|scope| {
            scope.spawn(|| {
                cache
                    .get_or_compute(1, || {
                        started.wait();
                        release.wait();
                        Ok::<_, ()>(10)
                    })
                    .unwrap();
            });

            started.wait();
            cache.get_or_compute(2, || Ok::<_, ()>(20)).unwrap();
            assert!(cache.len() <= 2);
            release.wait();
        });

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().computations, 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache: MemoCache<u32, u32> = MemoCache::new("errors", 2);
        let err = cache.get_or_compute(1, || Err::<u32, _>("boom"));
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let value = cache.get_or_compute(1, || Ok::<_, &str>(5)).unwrap();
        assert_eq!(*value, 5);
        let stats = cache.stats();
        assert_eq!(stats.computations, 2);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache: MemoCache<u32, u32> = MemoCache::new("clear", 2);
        cache.get_or_compute(1, || Ok::<_, ()>(1)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.peek(&1).is_none());
    }
}
