//! A sharded concurrent hash map: writers serialize per-bucket with a spin
//! lock, readers walk bucket chains lock-free under an epoch guard. Shards
//! exist to cut writer contention (two threads hashing to different shards
//! never touch the same lock); buckets inside a shard are an ordinary
//! chained hash table.
//!
//! Closest teacher analogue: the original `concurrent_hash_map.h` pairs a
//! lock per bucket with lock-free reads guarded by its epoch reclaimer;
//! this module carries that split over [`SpinLock`] and [`EpochReclaimer`].

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::epoch::EpochReclaimer;
use crate::error::MapError;
use crate::spin_lock::{SpinLock, SpinLockGuard};

const DEFAULT_BUCKETS_PER_SHARD: usize = 16;
const MIN_SHARDS: usize = 8;
const MAX_SHARDS: usize = 512;

/// Point-in-time layout snapshot returned by [`ConcurrentHashMap::stats`],
/// mirroring the teacher's `get_sharding_info()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardingInfo {
    pub shard_count: usize,
    pub buckets_per_shard: usize,
    pub load_factor: f64,
}

struct Node<K, V> {
    key: K,
    value: std::cell::UnsafeCell<MaybeUninit<V>>,
    next: AtomicPtr<Node<K, V>>,
}

struct Bucket<K, V> {
    head: AtomicPtr<Node<K, V>>,
    lock: SpinLock<()>,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Self {
        Bucket {
            head: AtomicPtr::new(ptr::null_mut()),
            lock: SpinLock::new(()),
        }
    }
}

struct Shard<K, V> {
    buckets: Box<[Bucket<K, V>]>,
}

fn default_shard_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cores * 4).next_power_of_two().clamp(MIN_SHARDS, MAX_SHARDS)
}

/// A hash map safe to read and write from many threads at once without an
/// outer lock. Keys must be `Eq + Hash`; values have no bound beyond what an
/// individual method needs (`find` needs `Clone`, nothing else does).
pub struct ConcurrentHashMap<K, V, S = RandomState> {
    shards: Box<[Shard<K, V>]>,
    hasher: S,
    epoch: EpochReclaimer,
}

unsafe impl<K: Send, V: Send, S: Send> Send for ConcurrentHashMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ConcurrentHashMap<K, V, S> {}

impl<K: Hash + Eq, V> ConcurrentHashMap<K, V, RandomState> {
    pub fn new() -> Self {
        Self::with_shards(default_shard_count())
    }

    pub fn with_shards(shard_count: usize) -> Self {
        Self::with_shards_and_hasher(shard_count, RandomState::new())
    }
}

impl<K: Hash + Eq, V> Default for ConcurrentHashMap<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> ConcurrentHashMap<K, V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_shards_and_hasher(default_shard_count(), hasher)
    }

    pub fn with_shards_and_hasher(shard_count: usize, hasher: S) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| Shard {
                buckets: (0..DEFAULT_BUCKETS_PER_SHARD).map(|_| Bucket::default()).collect(),
            })
            .collect();
        ConcurrentHashMap {
            shards,
            hasher,
            epoch: EpochReclaimer::new(),
        }
    }

    fn hash_key(&self, key: &K) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn locate(&self, key: &K) -> (&Shard<K, V>, usize) {
        let h = self.hash_key(key);
        let shard = &self.shards[(h as usize) & (self.shards.len() - 1)];
        let bucket_idx = ((h >> 32) as usize) & (shard.buckets.len() - 1);
        (shard, bucket_idx)
    }

    /// Inserts `key`/`value`. Fails with [`MapError::AlreadyPresent`],
    /// leaving the map unchanged, if `key` is already present.
    pub fn insert(&self, key: K, value: V) -> Result<(), MapError> {
        let (shard, bucket_idx) = self.locate(&key);
        let bucket = &shard.buckets[bucket_idx];
        let _guard = self.epoch.pin();
        let _lock = bucket.lock.lock();

        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.key == key {
                return Err(MapError::AlreadyPresent);
            }
            cur = node.next.load(Ordering::Acquire);
        }

        let head = bucket.head.load(Ordering::Acquire);
        let node = Box::into_raw(Box::new(Node {
            key,
            value: std::cell::UnsafeCell::new(MaybeUninit::new(value)),
            next: AtomicPtr::new(head),
        }));
        bucket.head.store(node, Ordering::Release);
        Ok(())
    }

    /// Returns a clone of the value for `key`, if present. Lock-free: walks
    /// the bucket chain under an epoch guard without taking the writer lock.
    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let (shard, bucket_idx) = self.locate(key);
        let bucket = &shard.buckets[bucket_idx];
        let _guard = self.epoch.pin();

        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if &node.key == key {
                return Some(unsafe { (*node.value.get()).assume_init_ref().clone() });
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let (shard, bucket_idx) = self.locate(key);
        let bucket = &shard.buckets[bucket_idx];
        let _guard = self.epoch.pin();

        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if &node.key == key {
                return true;
            }
            cur = node.next.load(Ordering::Acquire);
        }
        false
    }

    /// Removes and returns the value for `key`. Fails with
    /// [`MapError::NotFound`] if there is no entry.
    pub fn erase(&self, key: &K) -> Result<V, MapError> {
        let (shard, bucket_idx) = self.locate(key);
        let bucket = &shard.buckets[bucket_idx];
        let _guard = self.epoch.pin();
        let _lock = bucket.lock.lock();

        let mut prev: *mut Node<K, V> = ptr::null_mut();
        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if &node.key == key {
                let next = node.next.load(Ordering::Acquire);
                if prev.is_null() {
                    bucket.head.store(next, Ordering::Release);
                } else {
                    unsafe {
                        (*prev).next.store(next, Ordering::Release);
                    }
                }
                let value = unsafe { (*node.value.get()).assume_init_read() };
                self.epoch.retire_boxed(cur);
                return Ok(value);
            }
            prev = cur;
            cur = node.next.load(Ordering::Acquire);
        }
        Err(MapError::NotFound)
    }

    /// Approximate: a consistent snapshot would need to freeze every bucket
    /// at once, which this map never does. Good enough for monitoring, not
    /// for anything that depends on being exact.
    pub fn len(&self) -> usize {
        let _guard = self.epoch.pin();
        self.shards
            .iter()
            .flat_map(|s| s.buckets.iter())
            .map(|b| {
                let mut n = 0usize;
                let mut cur = b.head.load(Ordering::Acquire);
                while !cur.is_null() {
                    n += 1;
                    cur = unsafe { (*cur).next.load(Ordering::Acquire) };
                }
                n
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires every shard's every bucket lock, in fixed shard/bucket
    /// index order, and holds all of them for as long as the returned
    /// vector lives. `for_each`/`clear` use this to get a true whole-map
    /// snapshot instead of a per-bucket-at-a-time view; always lock in this
    /// order everywhere to avoid deadlocking against another whole-map
    /// operation.
    fn lock_all_buckets(&self) -> Vec<SpinLockGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.shards.iter().map(|s| s.buckets.len()).sum());
        for shard in self.shards.iter() {
            for bucket in shard.buckets.iter() {
                guards.push(bucket.lock.lock());
            }
        }
        guards
    }

    /// Visits every entry under a consistent whole-map snapshot: every
    /// bucket's lock is held for the entire traversal, so no concurrent
    /// `insert`/`erase` can interleave with it.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let _guard = self.epoch.pin();
        let _locks = self.lock_all_buckets();
        for shard in self.shards.iter() {
            for bucket in shard.buckets.iter() {
                let mut cur = bucket.head.load(Ordering::Acquire);
                while !cur.is_null() {
                    let node = unsafe { &*cur };
                    let value = unsafe { (*node.value.get()).assume_init_ref() };
                    f(&node.key, value);
                    cur = node.next.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Removes every entry as a single consistent whole-map snapshot: every
    /// bucket's lock is acquired up front, in fixed order, before any
    /// bucket is swapped out, so a concurrent reader or writer never
    /// observes a partially-cleared map.
    pub fn clear(&self) {
        let _guard = self.epoch.pin();
        let _locks = self.lock_all_buckets();
        for shard in self.shards.iter() {
            for bucket in shard.buckets.iter() {
                let mut cur = bucket.head.swap(ptr::null_mut(), Ordering::AcqRel);
                while !cur.is_null() {
                    let next = unsafe { (*cur).next.load(Ordering::Acquire) };
                    unsafe {
                        ptr::drop_in_place((*cur).value.get() as *mut V);
                    }
                    self.epoch.retire_boxed(cur);
                    cur = next;
                }
            }
        }
    }

    /// Point-in-time layout snapshot, for monitoring: shard count, buckets
    /// per shard, and the approximate load factor (`len() / total buckets`).
    /// Mirrors the teacher's `get_sharding_info()`.
    pub fn stats(&self) -> ShardingInfo {
        let buckets_per_shard = self.shards.first().map(|s| s.buckets.len()).unwrap_or(0);
        let total_buckets = self.shards.len() * buckets_per_shard;
        let load_factor = if total_buckets == 0 {
            0.0
        } else {
            self.len() as f64 / total_buckets as f64
        };
        ShardingInfo {
            shard_count: self.shards.len(),
            buckets_per_shard,
            load_factor,
        }
    }
}

impl<K, V, S> Drop for ConcurrentHashMap<K, V, S> {
    fn drop(&mut self) {
        for shard in self.shards.iter() {
            for bucket in shard.buckets.iter() {
                let mut cur = *bucket.head.get_mut();
                while !cur.is_null() {
                    let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
                    unsafe {
                        ptr::drop_in_place((*cur).value.get() as *mut V);
                        drop(Box::from_raw(cur));
                    }
                    cur = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_erase_round_trip() {
        let map: ConcurrentHashMap<String, i32> = ConcurrentHashMap::new();
        map.insert("a".to_string(), 1).unwrap();
        assert_eq!(map.find(&"a".to_string()), Some(1));
        assert_eq!(map.insert("a".to_string(), 2), Err(MapError::AlreadyPresent));
        assert_eq!(map.erase(&"a".to_string()), Ok(1));
        assert_eq!(map.find(&"a".to_string()), None);
        assert_eq!(map.erase(&"a".to_string()), Err(MapError::NotFound));
    }

    #[test]
    fn drops_remaining_values_on_map_drop() {
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Counted(Rc<RefCell<i32>>);
        impl Drop for Counted {
            fn drop(&mut self) {
                *self.0.borrow_mut() += 1;
            }
        }

        let count = Rc::new(RefCell::new(0));
        {
            let map: ConcurrentHashMap<i32, Counted> = ConcurrentHashMap::with_shards(8);
            for i in 0..20 {
                map.insert(i, Counted(count.clone())).unwrap();
            }
        }
        assert_eq!(*count.borrow(), 20);
    }

    #[test]
    fn for_each_visits_every_entry_exactly_once() {
        let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::with_shards(8);
        for i in 0..50 {
            map.insert(i, i * 3).unwrap();
        }
        let mut seen = vec![];
        map.for_each(|k, v| seen.push((*k, *v)));
        seen.sort_unstable();
        let mut expected: Vec<_> = (0..50).map(|i| (i, i * 3)).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn clear_empties_the_whole_map() {
        let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::with_shards(4);
        for i in 0..30 {
            map.insert(i, i).unwrap();
        }
        map.clear();
        assert!(map.is_empty());
        for i in 0..30 {
            assert_eq!(map.find(&i), None);
        }
    }

    #[test]
    fn stats_reports_shard_layout_and_load_factor() {
        let map: ConcurrentHashMap<i32, i32> = ConcurrentHashMap::with_shards(8);
        for i in 0..16 {
            map.insert(i, i).unwrap();
        }
        let stats = map.stats();
        assert_eq!(stats.shard_count, 8);
        assert_eq!(stats.buckets_per_shard, DEFAULT_BUCKETS_PER_SHARD);
        assert!(stats.load_factor > 0.0);
    }

    #[test]
    fn concurrent_insert_and_find_are_consistent() {
        let map = Arc::new(ConcurrentHashMap::<i32, i32>::with_shards(16));
        let mut writers = vec![];
        for t in 0..4 {
            let map = map.clone();
            writers.push(thread::spawn(move || {
                for i in 0..500 {
                    let key = t * 500 + i;
                    map.insert(key, key * 2).unwrap();
                }
            }));
        }
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
        for t in 0..4 {
            for i in 0..500 {
                let key = t * 500 + i;
                assert_eq!(map.find(&key), Some(key * 2));
            }
        }
    }

    #[test]
    fn readers_never_see_a_torn_chain_during_churn() {
        let map = Arc::new(ConcurrentHashMap::<i32, i32>::with_shards(4));
        for i in 0..200 {
            map.insert(i, i).unwrap();
        }
        let stop = Arc::new(AtomicUsize::new(0));
        let writer = {
            let map = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                for round in 0..2000 {
                    let key = round % 200;
                    if map.erase(&key).is_ok() {
                        map.insert(key, key).unwrap();
                    }
                }
                stop.store(1, Ordering::Relaxed);
            })
        };
        let reader = {
            let map = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while stop.load(Ordering::Relaxed) == 0 {
                    for key in 0..200 {
                        if let Some(v) = map.find(&key) {
                            assert_eq!(v, key);
                        }
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
