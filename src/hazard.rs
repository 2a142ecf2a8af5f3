//! Hazard-pointer manager: lets a thread publish "I am about to dereference
//! this pointer" so a concurrent reclaimer cannot free it out from under a
//! reader. Used by the unbounded SPMC/MPMC queues (see [`crate::queue`]) to
//! protect `head`/`head.next` across the CAS that unlinks a node.
//!
//! Each [`HazardPointerManager`] instance owns its own fixed-size thread
//! table rather than reaching for one process-wide singleton — a queue or
//! map embeds one and it lives exactly as long as its owner.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use log::warn;

use crate::error::HazardStatus;
use crate::util::{cpu_relax, MAX_THREADS};

/// Hazard slots published per thread: head, head.next, and tail (the MPMC
/// unbounded queue's producer side protects `tail` before dereferencing it).
pub const HAZARD_SLOTS_PER_THREAD: usize = 3;

const DEFAULT_RECLAIM_THRESHOLD: usize = 64;

/// Snapshot of a [`HazardPointerManager`]'s bookkeeping, mirroring the
/// teacher's `get_hazard_waiting_count`-style accessors as a single
/// returned-by-value struct instead of several loose getters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HazardStats {
    pub active_threads: usize,
    pub retired_len: usize,
    pub reclaim_threshold: usize,
}

type Deleter = Box<dyn FnOnce(*mut ()) + Send>;

struct Retired {
    ptr: *mut (),
    deleter: Deleter,
}

struct ThreadRecord {
    active: AtomicBool,
    hazards: [AtomicPtr<()>; HAZARD_SLOTS_PER_THREAD],
    // Only the thread that owns this record (the one that claimed `active`)
    // ever touches `retired`; every other thread only reads `hazards`. Safe
    // by the same single-writer argument the original C++ record relies on.
    retired: UnsafeCell<Vec<Retired>>,
}

// Only the owning thread ever touches `retired`, including the raw
// pointers and boxed deleters inside it; handing the whole manager to
// another thread (e.g. via `Arc`) only requires that the *manager* move,
// never that a `ThreadRecord`'s retired list be touched from elsewhere.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl Default for ThreadRecord {
    fn default() -> Self {
        ThreadRecord {
            active: AtomicBool::new(false),
            hazards: [const { AtomicPtr::new(std::ptr::null_mut()) }; HAZARD_SLOTS_PER_THREAD],
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

impl ThreadRecord {
    #[allow(clippy::mut_from_ref)]
    unsafe fn retired_mut(&self) -> &mut Vec<Retired> {
        unsafe { &mut *self.retired.get() }
    }
}

thread_local! {
    // (manager address, slot index) pairs this thread currently holds.
    // Keyed by manager address because one thread may use several
    // independent HazardPointerManager instances (one per queue).
    static SLOT_CACHE: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

/// A hazard-pointer manager embedded in a lock-free structure. `TNode` is
/// the node type whose pointers get protected and retired.
pub struct HazardPointerManager<TNode> {
    records: Box<[ThreadRecord]>,
    next_record_idx: AtomicUsize,
    reclaim_threshold: AtomicUsize,
    _marker: std::marker::PhantomData<fn(*mut TNode)>,
}

impl<TNode> Default for HazardPointerManager<TNode> {
    fn default() -> Self {
        HazardPointerManager::new()
    }
}

impl<TNode> HazardPointerManager<TNode> {
    pub fn new() -> Self {
        let records = (0..MAX_THREADS).map(|_| ThreadRecord::default()).collect();
        HazardPointerManager {
            records,
            next_record_idx: AtomicUsize::new(0),
            reclaim_threshold: AtomicUsize::new(DEFAULT_RECLAIM_THRESHOLD),
            _marker: std::marker::PhantomData,
        }
    }

    fn self_addr(&self) -> usize {
        self as *const _ as usize
    }

    /// Find (or lazily register) the calling thread's record index.
    fn thread_record_idx(&self) -> usize {
        let addr = self.self_addr();
        SLOT_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(&(_, idx)) = cache.iter().find(|&&(a, _)| a == addr) {
                return idx;
            }
            let idx = self.register_new_thread();
            cache.push((addr, idx));
            idx
        })
    }

    fn register_new_thread(&self) -> usize {
        // Fast path: an uncontended fetch-add into the table.
        let idx = self.next_record_idx.fetch_add(1, Ordering::Relaxed);
        if idx < MAX_THREADS {
            self.records[idx].active.store(true, Ordering::Release);
            return idx;
        }
        // Table nominally full: a thread may have exited and freed its slot
        // (via `release_current_thread`), so scan for one.
        for (i, rec) in self.records.iter().enumerate() {
            if rec
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return i;
            }
        }
        // Every slot is genuinely occupied: degrade by sharing the last
        // slot. Hazard publication still works (it's just one more thread
        // contending on the same atomics), only the bookkeeping is shared.
        warn!(
            "hazard pointer manager: {} threads registered, degrading to shared last slot",
            MAX_THREADS
        );
        MAX_THREADS - 1
    }

    /// Publish `p` into the caller's hazard slot.
    pub fn protect(&self, slot: usize, p: *mut TNode) -> *mut TNode {
        let idx = self.thread_record_idx();
        self.records[idx].hazards[slot].store(p as *mut (), Ordering::Release);
        p
    }

    /// Like [`protect`](Self::protect), but reports whether the slot was
    /// already holding a different live hazard before the call — a caller
    /// bug, since slots are meant to be [`clear`](Self::clear)ed before
    /// being reused for something else. Overwrites either way; the status
    /// is purely diagnostic.
    pub fn try_protect(&self, slot: usize, p: *mut TNode) -> HazardStatus {
        let idx = self.thread_record_idx();
        let prev = self.records[idx].hazards[slot].swap(p as *mut (), Ordering::AcqRel);
        if !prev.is_null() && prev != p as *mut () {
            warn!("hazard pointer manager: slot {slot} re-armed while still holding a live hazard");
            HazardStatus::Busy
        } else {
            HazardStatus::Success
        }
    }

    /// Clear the caller's hazard slot.
    pub fn clear(&self, slot: usize) {
        let idx = self.thread_record_idx();
        self.records[idx].hazards[slot].store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Load `target`, publish it, then re-load and compare; retries until the
    /// published value is confirmed still current. Returns a pointer that is
    /// safe to dereference until the matching `clear`.
    pub fn acquire(&self, slot: usize, target: &AtomicPtr<TNode>) -> *mut TNode {
        loop {
            let p = target.load(Ordering::Acquire);
            self.protect(slot, p);
            if p == target.load(Ordering::Acquire) {
                return p;
            }
            cpu_relax();
        }
    }

    /// Enqueue `node` for deferred reclamation once no thread can still hold
    /// a hazard on it, triggering a reclamation pass at the threshold.
    pub fn retire(&self, node: *mut TNode)
    where
        TNode: 'static,
    {
        if node.is_null() {
            return;
        }
        let idx = self.thread_record_idx();
        let retired = unsafe { self.records[idx].retired_mut() };
        retired.push(Retired {
            ptr: node as *mut (),
            deleter: Box::new(|p: *mut ()| unsafe {
                drop(Box::from_raw(p as *mut TNode));
            }),
        });
        if retired.len() >= self.reclaim_threshold.load(Ordering::Relaxed) {
            self.try_reclaim(idx, false);
        }
    }

    /// Force a reclamation pass. See the `force` semantics on
    /// [`HazardPointerManager::drain`].
    pub fn drain(&self) {
        let idx = self.thread_record_idx();
        self.try_reclaim(idx, true);
    }

    /// Release the calling thread's registration. Only call this at the end
    /// of a thread's lifetime — reusing the manager from this thread
    /// afterwards registers a fresh slot.
    pub fn release_current_thread(&self) {
        let idx = self.thread_record_idx();
        for h in &self.records[idx].hazards {
            h.store(std::ptr::null_mut(), Ordering::Release);
        }
        self.try_reclaim(idx, true);
        self.records[idx].active.store(false, Ordering::Release);
        let addr = self.self_addr();
        SLOT_CACHE.with(|cache| cache.borrow_mut().retain(|&(a, _)| a != addr));
    }

    pub fn set_threshold(&self, n: usize) {
        self.reclaim_threshold.store(n, Ordering::Relaxed);
    }

    pub fn threshold(&self) -> usize {
        self.reclaim_threshold.load(Ordering::Relaxed)
    }

    pub fn retired_len(&self) -> usize {
        let idx = self.thread_record_idx();
        unsafe { self.records[idx].retired_mut().len() }
    }

    pub fn active_threads(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.active.load(Ordering::Acquire))
            .count()
    }

    /// Point-in-time snapshot of this manager's bookkeeping, for monitoring.
    pub fn stats(&self) -> HazardStats {
        HazardStats {
            active_threads: self.active_threads(),
            retired_len: self.retired_len(),
            reclaim_threshold: self.threshold(),
        }
    }

    /// Free every retired node this thread holds that is not currently
    /// hazarded by any active thread.
    ///
    /// `force` additionally frees anything left over, but only once this
    /// manager reports zero active threads (true process quiescence) — it
    /// will never free a node some other thread might still be protecting.
    /// What it cannot safely free it logs at `warn!` and leaves retained;
    /// the original's unconditional "free regardless of hazards" shutdown
    /// path is deliberately not exposed here, since there is no way for the
    /// library to prove that is safe from inside itself.
    fn try_reclaim(&self, idx: usize, force: bool) {
        let retired = unsafe { self.records[idx].retired_mut() };
        if retired.is_empty() {
            return;
        }

        let mut hazards_snapshot: Vec<*mut ()> = Vec::with_capacity(MAX_THREADS * HAZARD_SLOTS_PER_THREAD);
        for rec in self.records.iter() {
            if !rec.active.load(Ordering::Acquire) {
                continue;
            }
            for h in &rec.hazards {
                let p = h.load(Ordering::Acquire);
                if !p.is_null() {
                    hazards_snapshot.push(p);
                }
            }
        }

        let mut i = 0;
        while i < retired.len() {
            if !hazards_snapshot.contains(&retired[i].ptr) {
                let entry = retired.swap_remove(i);
                (entry.deleter)(entry.ptr);
            } else {
                i += 1;
            }
        }

        if force && !retired.is_empty() {
            let other_active = self
                .records
                .iter()
                .enumerate()
                .filter(|&(i, r)| i != idx && r.active.load(Ordering::Acquire))
                .count();
            if other_active == 0 {
                let leftover = std::mem::take(retired);
                for entry in leftover {
                    (entry.deleter)(entry.ptr);
                }
            } else {
                warn!(
                    "hazard pointer manager: {} retired node(s) still hazarded at drain, keeping them",
                    retired.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicPtr;

    struct Node {
        value: i32,
    }

    #[test]
    fn protect_and_clear_round_trip() {
        let hpm: HazardPointerManager<Node> = HazardPointerManager::new();
        let n = Box::into_raw(Box::new(Node { value: 1 }));
        assert_eq!(hpm.protect(0, n), n);
        hpm.clear(0);
        unsafe {
            drop(Box::from_raw(n));
        }
    }

    #[test]
    fn acquire_returns_current_value() {
        let hpm: HazardPointerManager<Node> = HazardPointerManager::new();
        let n = Box::into_raw(Box::new(Node { value: 2 }));
        let target = AtomicPtr::new(n);
        let p = hpm.acquire(0, &target);
        assert_eq!(p, n);
        hpm.clear(0);
        unsafe {
            drop(Box::from_raw(n));
        }
    }

    #[test]
    fn retire_reclaims_when_unhazarded() {
        let cnt = Rc::new(StdRefCell::new(0));
        struct Counted(Rc<StdRefCell<i32>>);
        impl Drop for Counted {
            fn drop(&mut self) {
                *self.0.borrow_mut() += 1;
            }
        }
        let hpm: HazardPointerManager<Counted> = HazardPointerManager::new();
        hpm.set_threshold(1);
        for _ in 0..8 {
            let n = Box::into_raw(Box::new(Counted(cnt.clone())));
            hpm.retire(n);
        }
        assert_eq!(*cnt.borrow(), 8);
    }

    #[test]
    fn retire_keeps_hazarded_node_until_cleared() {
        let hpm: HazardPointerManager<Node> = HazardPointerManager::new();
        let n = Box::into_raw(Box::new(Node { value: 3 }));
        hpm.protect(0, n);
        hpm.retire(n);
        hpm.drain();
        assert_eq!(hpm.retired_len(), 1);
        hpm.clear(0);
        hpm.drain();
        assert_eq!(hpm.retired_len(), 0);
    }

    #[test]
    fn try_protect_reports_busy_on_reentrant_slot() {
        let hpm: HazardPointerManager<Node> = HazardPointerManager::new();
        let a = Box::into_raw(Box::new(Node { value: 1 }));
        let b = Box::into_raw(Box::new(Node { value: 2 }));
        assert_eq!(hpm.try_protect(0, a), HazardStatus::Success);
        assert_eq!(hpm.try_protect(0, b), HazardStatus::Busy);
        hpm.clear(0);
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn stats_reflects_retired_and_active_counts() {
        let hpm: HazardPointerManager<Node> = HazardPointerManager::new();
        hpm.set_threshold(100);
        let n = Box::into_raw(Box::new(Node { value: 1 }));
        hpm.protect(0, n);
        hpm.retire(n);
        let stats = hpm.stats();
        assert_eq!(stats.active_threads, 1);
        assert_eq!(stats.retired_len, 1);
        assert_eq!(stats.reclaim_threshold, 100);
        hpm.clear(0);
        hpm.drain();
    }

    #[test]
    fn multi_thread_no_leak() {
        use std::sync::atomic::AtomicI64;
        use std::sync::Arc;

        struct Counted(Arc<AtomicI64>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let hpm: Arc<HazardPointerManager<Counted>> = Arc::new(HazardPointerManager::new());
        let live = Arc::new(AtomicI64::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let hpm = hpm.clone();
            let live = live.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    live.fetch_add(1, Ordering::SeqCst);
                    let n = Box::into_raw(Box::new(Counted(live.clone())));
                    hpm.retire(n);
                }
                hpm.drain();
                hpm.release_current_thread();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        hpm.drain();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }
}
