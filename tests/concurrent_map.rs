//! Stress tests for the sharded concurrent hash map.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use corona_lockfree::error::MapError;
use corona_lockfree::map::ConcurrentHashMap;

/// Tiny deterministic xorshift64 generator so the mixed workload below is
/// reproducible without pulling in a `rand` dependency just for test code.
struct Xorshift64(u64);

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Xorshift64(seed | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Invariant every value in this map must uphold: the value for key `k` is
/// always `k * 7`, whether it got there via the initial seeding or a racing
/// `insert`.
fn value_for(key: i64) -> i64 {
    key * 7
}

/// Scenario E: 8 threads all operate on the same `[0, 10000)` key range,
/// each performing a mix of 80% `find` / 15% `insert` / 5% `erase`. Any key
/// observed as a `find` hit must carry its invariant value — there is no
/// intervening successful `erase` between the value being written and this
/// read observing it, since a value is only ever `key * 7`.
#[test]
fn concurrent_insert_find_erase_is_consistent() {
    let _ = env_logger::try_init();
    let map = Arc::new(ConcurrentHashMap::<i64, i64>::with_shards(32));
    let key_space = 10_000i64;
    let thread_count = 8u64;
    let ops_per_thread = 20_000u64;

    // Seed half the key space so `find`/`erase` have something to do from
    // the first operation onward, instead of only ever racing `insert`.
    for key in (0..key_space).step_by(2) {
        map.insert(key, value_for(key)).unwrap();
    }

    let mut workers = vec![];
    for t in 0..thread_count {
        let map = map.clone();
        workers.push(thread::spawn(move || {
            let mut rng = Xorshift64::new(0x9E3779B97F4A7C15 ^ (t + 1));
            for _ in 0..ops_per_thread {
                let key = rng.below(key_space as u64) as i64;
                let roll = rng.below(100);
                if roll < 80 {
                    if let Some(v) = map.find(&key) {
                        assert_eq!(v, value_for(key), "value must always match key * 7");
                    }
                } else if roll < 95 {
                    match map.insert(key, value_for(key)) {
                        Ok(()) | Err(MapError::AlreadyPresent) => {}
                        Err(e) => panic!("unexpected insert error: {e:?}"),
                    }
                } else {
                    match map.erase(&key) {
                        Ok(v) => assert_eq!(v, value_for(key)),
                        Err(MapError::NotFound) => {}
                        Err(e) => panic!("unexpected erase error: {e:?}"),
                    }
                }
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    // Whatever is left standing must still satisfy the key/value invariant;
    // no concurrent interleaving of insert/erase on the shared range should
    // ever produce a stored value that doesn't match its key.
    for key in 0..key_space {
        if let Some(v) = map.find(&key) {
            assert_eq!(v, value_for(key));
        }
    }
}

/// Scenario F: readers running concurrently with a writer that repeatedly
/// erases and reinserts the same keys must never observe a partially
/// constructed entry or a value that doesn't match its key's invariant.
#[test]
fn read_heavy_workload_stays_consistent_under_churn() {
    let _ = env_logger::try_init();
    let key_count = 256i64;
    let map = Arc::new(ConcurrentHashMap::<i64, i64>::with_shards(16));
    for k in 0..key_count {
        map.insert(k, k * k).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let churn_rounds = Arc::new(AtomicI64::new(0));

    let writer = {
        let map = map.clone();
        let stop = stop.clone();
        let churn_rounds = churn_rounds.clone();
        thread::spawn(move || {
            let mut round = 0i64;
            while round < 50_000 {
                let key = round % key_count;
                if map.erase(&key).is_ok() {
                    map.insert(key, key * key).unwrap();
                }
                round += 1;
            }
            churn_rounds.store(round, Ordering::Relaxed);
            stop.store(true, Ordering::Release);
        })
    };

    let reader_count = 4;
    let mut readers = vec![];
    for _ in 0..reader_count {
        let map = map.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut observed = 0usize;
            while !stop.load(Ordering::Acquire) {
                for k in 0..key_count {
                    if let Some(v) = map.find(&k) {
                        assert_eq!(v, k * k, "value must always match its key's invariant");
                        observed += 1;
                    }
                }
            }
            observed
        }));
    }

    writer.join().unwrap();
    for r in readers {
        let observed = r.join().unwrap();
        assert!(observed > 0, "reader should have observed at least some entries");
    }

    for k in 0..key_count {
        assert_eq!(map.find(&k), Some(k * k));
    }
}
