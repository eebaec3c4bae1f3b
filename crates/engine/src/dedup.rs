//! Bounded LRU set of jobs that have already been notified.
//!
//! A job that keeps failing produces a stream of Modified events; only the
//! first one that reaches [`DedupCache::claim`] is allowed to notify. The cache
//! is in-memory only, so after a restart jobs are re-seeded by the preload step.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// Default number of UIDs remembered.
pub const DEFAULT_CAPACITY: usize = 8192;

/// Thread-safe LRU set of job UIDs.
pub struct DedupCache {
    inner: Mutex<Lru>,
}

struct Lru {
    capacity: usize,
    tick: u64,
    /// uid -> last-use tick
    entries: HashMap<String, u64>,
    /// last-use tick -> uid, oldest first
    order: BTreeMap<u64, String>,
}

impl Lru {
    fn touch(&mut self, id: &str) -> bool {
        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(id) {
            Some(stamp) => {
                self.order.remove(stamp);
                *stamp = tick;
                self.order.insert(tick, id.to_string());
                false
            }
            None => {
                self.entries.insert(id.to_string(), tick);
                self.order.insert(tick, id.to_string());
                while self.entries.len() > self.capacity {
                    let Some((_, oldest)) = self.order.pop_first() else {
                        break;
                    };
                    self.entries.remove(&oldest);
                }
                true
            }
        }
    }
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            tracing::warn!("Dedup cache capacity 0 is not supported, using 1");
            1
        } else {
            capacity
        };
        Self {
            inner: Mutex::new(Lru {
                capacity,
                tick: 0,
                entries: HashMap::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                order: BTreeMap::new(),
            }),
        }
    }

    /// Whether `id` is remembered. Does not refresh its recency.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Remember `id`, refreshing it if already present.
    pub fn add(&self, id: &str) {
        self.inner.lock().touch(id);
    }

    /// Atomic check-then-insert. Returns `true` only for the caller that
    /// inserted `id`; an already-present id is refreshed and `false` returned.
    pub fn claim(&self, id: &str) -> bool {
        self.inner.lock().touch(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = DedupCache::new(2);
        cache.add("a");
        cache.add("b");
        cache.add("a"); // refresh a, b is now oldest
        cache.add("c");

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_contains_does_not_refresh() {
        let cache = DedupCache::new(2);
        cache.add("a");
        cache.add("b");
        assert!(cache.contains("a"));
        cache.add("c");
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_claim_is_first_wins() {
        let cache = DedupCache::new(4);
        assert!(cache.claim("uid-1"));
        assert!(!cache.claim("uid-1"));
        assert!(cache.claim("uid-2"));
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.add("a");
        cache.add("b");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let cache = Arc::new(DedupCache::new(16));
        let winners: usize = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.claim("same-uid") as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..32,
            ids in proptest::collection::vec(0u8..64, 0..256),
        ) {
            let cache = DedupCache::new(capacity);
            for id in &ids {
                cache.add(&id.to_string());
                prop_assert!(cache.len() <= capacity);
            }
            if let Some(last) = ids.last() {
                prop_assert!(cache.contains(&last.to_string()));
            }
        }

        #[test]
        fn prop_recent_ids_survive(
            capacity in 1usize..16,
            ids in proptest::collection::vec(0u16..1000, 1..200),
        ) {
            let cache = DedupCache::new(capacity);
            for id in &ids {
                cache.add(&id.to_string());
            }
            // The `capacity` most recently used distinct ids must all be present.
            let mut recent = Vec::new();
            for id in ids.iter().rev() {
                if !recent.contains(id) {
                    recent.push(*id);
                }
                if recent.len() == capacity {
                    break;
                }
            }
            for id in recent {
                prop_assert!(cache.contains(&id.to_string()));
            }
        }
    }
}
