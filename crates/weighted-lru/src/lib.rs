//! A weighted, reference-counted LRU cache.
//!
//! [`WeightedLruCache`] enforces a total weight budget across all of its items. Every
//! item is in one of two pools:
//!
//! - *acquired*: pinned by a non-zero reference count and immune to eviction,
//! - *released*: reference count of zero, ordered by recency and evictable whenever
//!   capacity is needed for a new item.
//!
//! Pinned weight alone must always fit into the budget; an [`acquire`] that cannot be
//! satisfied by evicting released items fails synchronously instead of waiting for
//! capacity to free up. Queuing and backoff are the caller's concern.
//!
//! The eviction callback runs synchronously inside the cache's critical section, so it
//! has to be cheap (think "remove a file", not "talk to the network").
//!
//! [`acquire`]: WeightedLruCache::acquire

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use thiserror::Error;

/// The cache cannot make room for an item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    /// The item's declared weight exceeds the total cache capacity, so it could never
    /// be admitted, not even into an empty cache.
    #[error("item weight {weight} exceeds total cache capacity {max_size}")]
    ItemTooLarge {
        /// Declared weight of the rejected item.
        weight: u64,
        /// Total capacity of the cache.
        max_size: u64,
    },
    /// Evicting every released item still would not make enough room; the pinned
    /// weight alone blocks the insert.
    #[error(
        "cannot free capacity for weight {weight}: \
         total weight {sum_weights}, acquired weight {sum_acquired}, capacity {max_size}"
    )]
    OutOfCapacity {
        /// Declared weight of the rejected item.
        weight: u64,
        /// Sum of weights over both pools at the time of the failure.
        sum_weights: u64,
        /// Sum of weights of pinned items at the time of the failure.
        sum_acquired: u64,
        /// Total capacity of the cache.
        max_size: u64,
    },
}

/// A single cache slot: the declared weight, the pin count, and the shared value.
struct CacheItem<V> {
    weight: u64,
    ref_count: u64,
    value: Arc<V>,
}

/// Outcome of [`WeightedLruCache::acquire`].
#[derive(Debug)]
pub struct Acquired<V> {
    /// The cached (or freshly inserted) value.
    pub value: Arc<V>,
    /// Whether this call inserted the value. The inserting caller is the one
    /// responsible for populating it.
    pub inserted: bool,
}

type EvictFn<K, V> = Box<dyn Fn(&K, &Arc<V>) + Send + Sync>;

struct Inner<K, V> {
    /// Sum of weights over both pools. Invariant: `sum_weights <= max_size`.
    sum_weights: u64,
    /// Sum of weights of acquired items. Invariant: `sum_acquired <= sum_weights`.
    sum_acquired: u64,
    acquired: HashMap<K, CacheItem<V>>,
    released: LruCache<K, CacheItem<V>>,
}

/// A key-weight-value store enforcing a total weight budget, with acquire/release
/// pinning. See the [module docs](self) for the full semantics.
pub struct WeightedLruCache<K, V> {
    max_size: u64,
    inner: Mutex<Inner<K, V>>,
    on_evict: EvictFn<K, V>,
}

impl<K: Eq + Hash + Clone, V> WeightedLruCache<K, V> {
    /// Creates a cache with a total weight budget of `max_size`.
    ///
    /// `max_items` bounds the *released* pool only; exceeding it evicts the least
    /// recently used released item. `on_evict` is invoked for every item leaving the
    /// cache for good, synchronously under the cache lock.
    pub fn new(
        max_size: u64,
        max_items: NonZeroUsize,
        on_evict: impl Fn(&K, &Arc<V>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_size,
            inner: Mutex::new(Inner {
                sum_weights: 0,
                sum_acquired: 0,
                acquired: HashMap::new(),
                released: LruCache::new(max_items),
            }),
            on_evict: Box::new(on_evict),
        }
    }

    /// Looks up or inserts the value for `key` and pins it.
    ///
    /// An already-acquired key only has its reference count bumped; a released key is
    /// promoted back into the acquired pool. Otherwise released items are evicted in
    /// LRU order until `weight` fits, `fetch` produces the new value, and
    /// `inserted` is reported as `true`.
    ///
    /// Every successful call must be paired with exactly one [`release`] or
    /// [`release_try_purge`], otherwise the item stays pinned forever.
    ///
    /// [`release`]: Self::release
    /// [`release_try_purge`]: Self::release_try_purge
    pub fn acquire(
        &self,
        key: K,
        weight: u64,
        fetch: impl FnOnce() -> V,
    ) -> Result<Acquired<V>, CapacityError> {
        if weight > self.max_size {
            return Err(CapacityError::ItemTooLarge {
                weight,
                max_size: self.max_size,
            });
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(item) = inner.acquired.get_mut(&key) {
            item.ref_count += 1;
            return Ok(Acquired {
                value: Arc::clone(&item.value),
                inserted: false,
            });
        }

        if let Some(mut item) = inner.released.pop(&key) {
            item.ref_count = 1;
            inner.sum_acquired += item.weight;
            let value = Arc::clone(&item.value);
            inner.acquired.insert(key, item);
            return Ok(Acquired {
                value,
                inserted: false,
            });
        }

        self.free_capacity(&mut inner, weight)?;

        let value = Arc::new(fetch());
        inner.sum_weights += weight;
        inner.sum_acquired += weight;
        inner.acquired.insert(
            key,
            CacheItem {
                weight,
                ref_count: 1,
                value: Arc::clone(&value),
            },
        );

        Ok(Acquired {
            value,
            inserted: true,
        })
    }

    /// Looks up or inserts the value for `key` *without* pinning it.
    ///
    /// The item lands directly in the released pool and may be evicted at any moment.
    /// Used to re-register already-complete items, for example during startup
    /// recovery.
    pub fn add(
        &self,
        key: K,
        weight: u64,
        fetch: impl FnOnce() -> V,
    ) -> Result<Arc<V>, CapacityError> {
        if weight > self.max_size {
            return Err(CapacityError::ItemTooLarge {
                weight,
                max_size: self.max_size,
            });
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(item) = inner.acquired.get(&key) {
            return Ok(Arc::clone(&item.value));
        }
        if let Some(item) = inner.released.get(&key) {
            return Ok(Arc::clone(&item.value));
        }

        self.free_capacity(&mut inner, weight)?;

        let value = Arc::new(fetch());
        inner.sum_weights += weight;
        let item = CacheItem {
            weight,
            ref_count: 0,
            value: Arc::clone(&value),
        };
        // `push` only hands an item back when `max_items` overflows; the key itself
        // cannot collide, it was checked absent above and the lock is still held.
        if let Some((victim, evicted)) = inner.released.push(key, item) {
            self.evict(&mut inner, &victim, &evicted);
        }

        Ok(value)
    }

    /// Drops one reference to `key`; at zero the item is demoted into the released
    /// pool, becoming evictable.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not currently acquired.
    pub fn release(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();

        let Some(item) = self.unpin(&mut inner, key) else {
            return;
        };
        if let Some((victim, evicted)) = inner.released.push(key.clone(), item) {
            self.evict(&mut inner, &victim, &evicted);
        }
    }

    /// Drops one reference to `key`; at zero the item is evicted immediately instead
    /// of being demoted. Returns whether the item was purged.
    ///
    /// Used when the value is known to be broken or incomplete and must not linger.
    ///
    /// # Panics
    ///
    /// Panics if `key` is not currently acquired.
    pub fn release_try_purge(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let Some(item) = self.unpin(&mut inner, key) else {
            return false;
        };
        self.evict(&mut inner, key, &item);
        true
    }

    /// Evicts every currently-released item.
    pub fn purge_released(&self) {
        let mut inner = self.inner.lock().unwrap();

        while let Some((key, item)) = inner.released.pop_lru() {
            self.evict(&mut inner, &key, &item);
        }
    }

    /// Sum of weights over both pools.
    pub fn total_weight(&self) -> u64 {
        self.inner.lock().unwrap().sum_weights
    }

    /// Sum of weights of pinned items.
    pub fn acquired_weight(&self) -> u64 {
        self.inner.lock().unwrap().sum_acquired
    }

    /// Evicts released items in LRU order until `weight` more fits into the budget.
    fn free_capacity(&self, inner: &mut Inner<K, V>, weight: u64) -> Result<(), CapacityError> {
        if self.max_size - inner.sum_acquired < weight {
            return Err(CapacityError::OutOfCapacity {
                weight,
                sum_weights: inner.sum_weights,
                sum_acquired: inner.sum_acquired,
                max_size: self.max_size,
            });
        }

        while inner.sum_weights + weight > self.max_size {
            // The released pool holds exactly `sum_weights - sum_acquired`, which the
            // check above proved sufficient, so the pool cannot run dry here.
            let Some((victim, item)) = inner.released.pop_lru() else {
                return Err(CapacityError::OutOfCapacity {
                    weight,
                    sum_weights: inner.sum_weights,
                    sum_acquired: inner.sum_acquired,
                    max_size: self.max_size,
                });
            };
            self.evict(inner, &victim, &item);
        }

        Ok(())
    }

    /// Removes one reference to an acquired item, extracting it at refcount zero.
    fn unpin(&self, inner: &mut Inner<K, V>, key: &K) -> Option<CacheItem<V>> {
        match inner.acquired.get_mut(key) {
            Some(item) if item.ref_count > 1 => {
                item.ref_count -= 1;
                None
            }
            Some(_) => {
                let mut item = inner.acquired.remove(key)?;
                item.ref_count = 0;
                inner.sum_acquired -= item.weight;
                Some(item)
            }
            None => panic!("released a cache key that is not acquired"),
        }
    }

    fn evict(&self, inner: &mut Inner<K, V>, key: &K, item: &CacheItem<V>) {
        inner.sum_weights -= item.weight;
        (self.on_evict)(key, &item.value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn max_items() -> NonZeroUsize {
        NonZeroUsize::new(1000).unwrap()
    }

    fn counting_cache(max_size: u64) -> (Arc<WeightedLruCache<String, u32>>, Arc<AtomicUsize>) {
        let evictions = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&evictions);
        let cache = WeightedLruCache::new(max_size, max_items(), move |_key, _value| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(cache), evictions)
    }

    #[test]
    fn acquire_reports_single_insert() {
        let (cache, _) = counting_cache(10);

        let first = cache.acquire("a".to_owned(), 2, || 1).unwrap();
        assert!(first.inserted);
        assert_eq!(*first.value, 1);

        let second = cache.acquire("a".to_owned(), 2, || 2).unwrap();
        assert!(!second.inserted);
        assert_eq!(*second.value, 1);

        cache.release(&"a".to_owned());
        cache.release(&"a".to_owned());
        assert_eq!(cache.acquired_weight(), 0);
        assert_eq!(cache.total_weight(), 2);
    }

    #[test]
    fn released_item_is_promoted_without_insert() {
        let (cache, evictions) = counting_cache(10);

        cache.acquire("a".to_owned(), 2, || 1).unwrap();
        cache.release(&"a".to_owned());

        let again = cache.acquire("a".to_owned(), 2, || 2).unwrap();
        assert!(!again.inserted);
        assert_eq!(*again.value, 1);
        assert_eq!(cache.acquired_weight(), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 0);

        cache.release(&"a".to_owned());
    }

    #[test]
    fn oversized_item_is_rejected() {
        let (cache, _) = counting_cache(10);

        let err = cache.acquire("big".to_owned(), 11, || 0).unwrap_err();
        assert_eq!(
            err,
            CapacityError::ItemTooLarge {
                weight: 11,
                max_size: 10
            }
        );
    }

    #[test]
    fn eviction_only_touches_released_items() {
        let (cache, evictions) = counting_cache(10);

        cache.acquire("pinned".to_owned(), 6, || 0).unwrap();
        cache.acquire("released".to_owned(), 4, || 0).unwrap();
        cache.release(&"released".to_owned());

        // Needs the released item's capacity.
        let got = cache.acquire("new".to_owned(), 4, || 0).unwrap();
        assert!(got.inserted);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_weight(), 10);

        // Only pinned weight remains; nothing more can be freed.
        let err = cache.acquire("blocked".to_owned(), 1, || 0).unwrap_err();
        assert!(matches!(err, CapacityError::OutOfCapacity { .. }));

        cache.release(&"pinned".to_owned());
        cache.release(&"new".to_owned());
    }

    #[test]
    fn eviction_follows_lru_order() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&evicted);
        let cache = WeightedLruCache::new(6, max_items(), move |key: &String, _value| {
            log.lock().unwrap().push(key.clone());
        });

        for key in ["a", "b", "c"] {
            cache.acquire(key.to_owned(), 2, || 0).unwrap();
        }
        cache.release(&"b".to_owned());
        cache.release(&"a".to_owned());
        cache.release(&"c".to_owned());

        // "b" was released first, so it is the least recently used.
        cache.acquire("d".to_owned(), 4, || 0).unwrap();
        assert_eq!(*evicted.lock().unwrap(), vec!["b".to_owned(), "a".to_owned()]);

        cache.release(&"d".to_owned());
    }

    #[test]
    fn add_registers_into_the_released_pool() {
        let (cache, evictions) = counting_cache(10);

        let value = cache.add("a".to_owned(), 4, || 7).unwrap();
        assert_eq!(*value, 7);
        assert_eq!(cache.total_weight(), 4);
        assert_eq!(cache.acquired_weight(), 0);

        // Already present: no second insert, no eviction.
        let value = cache.add("a".to_owned(), 4, || 8).unwrap();
        assert_eq!(*value, 7);
        assert_eq!(cache.total_weight(), 4);

        // The item is evictable right away.
        cache.purge_released();
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_weight(), 0);
    }

    #[test]
    fn release_try_purge_evicts_at_refcount_zero() {
        let (cache, evictions) = counting_cache(10);

        cache.acquire("a".to_owned(), 2, || 0).unwrap();
        cache.acquire("a".to_owned(), 2, || 0).unwrap();

        assert!(!cache.release_try_purge(&"a".to_owned()));
        assert_eq!(evictions.load(Ordering::SeqCst), 0);

        assert!(cache.release_try_purge(&"a".to_owned()));
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_weight(), 0);
        assert_eq!(cache.acquired_weight(), 0);
    }

    #[test]
    fn max_items_bounds_the_released_pool() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&evictions);
        let cache = WeightedLruCache::new(100, NonZeroUsize::new(2).unwrap(), move |_k, _v: &Arc<u32>| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        for key in ["a", "b", "c"] {
            cache.acquire(key.to_owned(), 1, || 0).unwrap();
            cache.release(&key.to_owned());
        }

        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_weight(), 2);
    }

    #[test]
    #[should_panic(expected = "not acquired")]
    fn releasing_unknown_key_panics() {
        let (cache, _) = counting_cache(10);
        cache.release(&"missing".to_owned());
    }

    #[test]
    fn concurrent_acquires_insert_exactly_once() {
        let (cache, _) = counting_cache(100);
        let inserts = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let inserts = Arc::clone(&inserts);
                std::thread::spawn(move || {
                    let got = cache.acquire("k".to_owned(), 10, || 42).unwrap();
                    if got.inserted {
                        inserts.fetch_add(1, Ordering::SeqCst);
                    }
                    assert_eq!(*got.value, 42);
                    cache.release(&"k".to_owned());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(inserts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.acquired_weight(), 0);
        assert_eq!(cache.total_weight(), 10);
    }

    #[test]
    fn weight_accounting_stays_within_budget() {
        let (cache, _) = counting_cache(20);

        for i in 0..10 {
            let key = format!("k{i}");
            if cache.acquire(key.clone(), 3, || 0).is_ok() {
                assert!(cache.total_weight() <= 20);
                assert!(cache.acquired_weight() <= cache.total_weight());
                if i % 2 == 0 {
                    cache.release(&key);
                }
            }
        }
        assert!(cache.total_weight() <= 20);
    }
}
