//! Fixed-capacity ring-buffer queues. Capacity is a const generic and must
//! be a non-zero power of two, checked once at construction (mirrors the
//! teacher's `static_assert` on the C++ side, which this crate can't do at
//! compile time without const-generic where-clauses stabilizing further).

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::QueueFull;
use crate::util::CachePadded;

fn assert_pow2_capacity(n: usize) {
    assert!(n > 0 && n.is_power_of_two(), "queue capacity must be a non-zero power of two");
}

/// Single-producer, single-consumer bounded queue. No atomic RMW on the hot
/// path at all: each side only ever writes its own index and reads the
/// other's, with a locally cached copy to avoid re-reading the other side's
/// cache line every call (mirrors `BoundedSPSCQueue.hpp`'s `head_cache_`/
/// `tail_cache_`).
pub struct BoundedSpsc<T, const N: usize> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    head_cache: Cell<usize>,
    tail_cache: Cell<usize>,
}

unsafe impl<T: Send, const N: usize> Send for BoundedSpsc<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedSpsc<T, N> {}

impl<T, const N: usize> BoundedSpsc<T, N> {
    pub fn new() -> Self {
        assert_pow2_capacity(N);
        let storage = (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();
        BoundedSpsc {
            storage,
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            head_cache: Cell::new(0),
            tail_cache: Cell::new(0),
        }
    }

    const MASK: usize = N - 1;

    /// Called from the single producer thread only.
    pub fn try_push(&self, value: T) -> Result<(), QueueFull<T>> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(self.head_cache.get()) >= N {
            self.head_cache.set(self.head.load(Ordering::Acquire));
            if tail.wrapping_sub(self.head_cache.get()) >= N {
                return Err(QueueFull(value));
            }
        }
        unsafe {
            (*self.storage[tail & Self::MASK].get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Called from the single consumer thread only.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if self.tail_cache.get() <= head {
            self.tail_cache.set(self.tail.load(Ordering::Acquire));
            if self.tail_cache.get() <= head {
                return None;
            }
        }
        let value = unsafe { (*self.storage[head & Self::MASK].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Approximate occupancy: exact for a single producer/consumer pair
    /// observed from either side, since there's no third party to race with.
    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for BoundedSpsc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for BoundedSpsc<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

struct Slot<T> {
    seq: AtomicUsize,
    storage: std::cell::UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Sync for Slot<T> {}

fn make_slots<T, const N: usize>() -> Box<[Slot<T>]> {
    (0..N)
        .map(|i| Slot {
            seq: AtomicUsize::new(i),
            storage: std::cell::UnsafeCell::new(MaybeUninit::uninit()),
        })
        .collect()
}

/// Multi-producer, single-consumer bounded queue (Vyukov ring on the
/// producer side; the sole consumer needs no CAS at all).
pub struct BoundedMpsc<T, const N: usize> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send, const N: usize> Send for BoundedMpsc<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedMpsc<T, N> {}

impl<T, const N: usize> BoundedMpsc<T, N> {
    pub fn new() -> Self {
        assert_pow2_capacity(N);
        BoundedMpsc {
            slots: make_slots::<T, N>(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    const MASK: usize = N - 1;

    /// Safe to call from any number of producer threads concurrently.
    pub fn try_push(&self, value: T) -> Result<(), QueueFull<T>> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & Self::MASK];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;
            if dif == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe {
                        (*slot.storage.get()).write(value);
                    }
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if dif < 0 {
                return Err(QueueFull(value));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Called from the single consumer thread only.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head & Self::MASK];
        let seq = slot.seq.load(Ordering::Acquire);
        let dif = seq as isize - (head as isize + 1);
        if dif != 0 {
            return None;
        }
        let value = unsafe { (*slot.storage.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        slot.seq.store(head.wrapping_add(N), Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for BoundedMpsc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for BoundedMpsc<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

/// Single-producer, multi-consumer bounded queue: the mirror image of
/// [`BoundedMpsc`] (no source for this combination exists in the original
/// `SafeQueue` header set; derived by swapping which side gets the CAS).
pub struct BoundedSpmc<T, const N: usize> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send, const N: usize> Send for BoundedSpmc<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedSpmc<T, N> {}

impl<T, const N: usize> BoundedSpmc<T, N> {
    pub fn new() -> Self {
        assert_pow2_capacity(N);
        BoundedSpmc {
            slots: make_slots::<T, N>(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    const MASK: usize = N - 1;

    /// Called from the single producer thread only.
    pub fn try_push(&self, value: T) -> Result<(), QueueFull<T>> {
        let pos = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[pos & Self::MASK];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != pos {
            return Err(QueueFull(value));
        }
        unsafe {
            (*slot.storage.get()).write(value);
        }
        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
        self.tail.store(pos.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Safe to call from any number of consumer threads concurrently.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & Self::MASK];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - (pos as isize + 1);
            if dif == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.storage.get()).assume_init_read() };
                    slot.seq.store(pos.wrapping_add(N), Ordering::Release);
                    return Some(value);
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for BoundedSpmc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for BoundedSpmc<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

/// Multi-producer, multi-consumer bounded queue: Vyukov's ring buffer on
/// both sides.
pub struct BoundedMpmc<T, const N: usize> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send, const N: usize> Send for BoundedMpmc<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedMpmc<T, N> {}

impl<T, const N: usize> BoundedMpmc<T, N> {
    pub fn new() -> Self {
        assert_pow2_capacity(N);
        BoundedMpmc {
            slots: make_slots::<T, N>(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    const MASK: usize = N - 1;

    pub fn try_push(&self, value: T) -> Result<(), QueueFull<T>> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & Self::MASK];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - pos as isize;
            if dif == 0 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe {
                        (*slot.storage.get()).write(value);
                    }
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if dif < 0 {
                return Err(QueueFull(value));
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & Self::MASK];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as isize - (pos as isize + 1);
            if dif == 0 {
                if self
                    .head
                    .compare_exchange_weak(pos, pos.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = unsafe { (*slot.storage.get()).assume_init_read() };
                    slot.seq.store(pos.wrapping_add(N), Ordering::Release);
                    return Some(value);
                }
            } else if dif < 0 {
                return None;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tail.load(Ordering::Acquire).wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for BoundedMpmc<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for BoundedMpmc<T, N> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_capacity() {
        let _q: BoundedSpsc<i32, 3> = BoundedSpsc::new();
    }

    #[test]
    fn spsc_fifo_order() {
        let q: BoundedSpsc<i32, 8> = BoundedSpsc::new();
        for i in 0..8 {
            q.try_push(i).unwrap();
        }
        assert!(q.try_push(99).is_err());
        for i in 0..8 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn spsc_producer_consumer_threads_preserve_order() {
        let q = Arc::new(BoundedSpsc::<i32, 16>::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    while q.try_push(i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };
        let mut received = Vec::with_capacity(2000);
        while received.len() < 2000 {
            if let Some(v) = q.try_pop() {
                received.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn mpsc_conserves_count_under_contention() {
        let q = Arc::new(BoundedMpsc::<i32, 64>::new());
        let total = Arc::new(StdAtomicUsize::new(0));
        let mut producers = vec![];
        for _ in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..500 {
                    while q.try_push(i).is_err() {
                        thread::yield_now();
                    }
                }
            }));
        }
        let consumer = {
            let q = q.clone();
            let total = total.clone();
            thread::spawn(move || {
                let mut count = 0;
                while count < 2000 {
                    if q.try_pop().is_some() {
                        count += 1;
                        total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        };
        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();
        assert_eq!(total.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn spmc_never_delivers_same_item_twice() {
        let q = Arc::new(BoundedSpmc::<i32, 64>::new());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    while q.try_push(i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut consumers = vec![];
        for _ in 0..4 {
            let q = q.clone();
            let seen = seen.clone();
            consumers.push(thread::spawn(move || {
                let mut local = vec![];
                loop {
                    match q.try_pop() {
                        Some(v) => local.push(v),
                        None => {
                            if seen.lock().unwrap().len() + local.len() >= 2000 {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                seen.lock().unwrap().extend(local);
            }));
        }
        producer.join().unwrap();
        for c in consumers {
            c.join().unwrap();
        }
        let mut all = seen.lock().unwrap().clone();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
    }

    #[test]
    fn mpmc_conserves_count_under_churn() {
        let q = Arc::new(BoundedMpmc::<i32, 64>::new());
        let produced_total = 4000usize;
        let mut producers = vec![];
        for _ in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..1000 {
                    while q.try_push(i).is_err() {
                        thread::yield_now();
                    }
                }
            }));
        }
        let consumed = Arc::new(StdAtomicUsize::new(0));
        let mut consumers = vec![];
        for _ in 0..4 {
            let q = q.clone();
            let consumed = consumed.clone();
            consumers.push(thread::spawn(move || loop {
                if q.try_pop().is_some() {
                    if consumed.fetch_add(1, Ordering::Relaxed) + 1 >= produced_total {
                        break;
                    }
                } else if consumed.load(Ordering::Relaxed) >= produced_total {
                    break;
                } else {
                    thread::yield_now();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::Relaxed), produced_total);
    }
}
