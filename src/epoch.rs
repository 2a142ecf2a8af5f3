//! Epoch-based reclamation: amortizes the per-access cost the hazard-pointer
//! manager pays by replacing per-pointer publication with a per-critical-
//! section epoch snapshot. Used by [`crate::map::ConcurrentHashMap`] for its
//! lock-free read path.
//!
//! Closest teacher analogue: `hazard_epoch.rs`'s `HazardEpoch`, a version-
//! counter scheme shaped like EBR (`version` plays the role of the global
//! epoch). That module's overall shape — fixed per-instance thread table,
//! cached minimum version recomputed only every so often — carries over
//! directly; the acquire/release handle API is replaced with an RAII guard,
//! and the advance/cleanup rules follow `epoch_reclaimer.h` exactly.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::{debug, error};

use crate::util::MAX_THREADS;

/// Guard exits between attempts to advance the global epoch.
const EPOCH_ADVANCE_THRESHOLD: usize = 32;
const BASE_CLEANUP_THRESHOLD: usize = 64;
const MIN_CLEANUP_THRESHOLD: usize = 8;
const CLEANUP_SCALE: usize = 2;
/// Bounded linear-scan attempts before giving up and panicking, matching the
/// original's retry bound rather than scanning forever.
const REGISTER_SCAN_ATTEMPTS: usize = 1024;

type Deleter = Box<dyn FnOnce(*mut ()) + Send>;

/// Snapshot of an [`EpochReclaimer`]'s bookkeeping, mirroring the teacher's
/// `EpochReclaimer::get_statistics()` as a single returned-by-value struct
/// instead of several loose getters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStats {
    pub global_epoch: u64,
    pub registered_threads: usize,
    pub active_threads: usize,
    pub pending_retired: usize,
}

struct Retired {
    ptr: *mut (),
    epoch: u64,
    deleter: Deleter,
}

struct ThreadEpochRecord {
    registered: AtomicBool,
    active: AtomicBool,
    local_epoch: AtomicU64,
    // Only the registering thread ever touches this; see the identical
    // argument in `hazard::ThreadRecord`.
    retired: UnsafeCell<Vec<Retired>>,
    exits_since_advance: Cell<usize>,
}

// See the identical reasoning on `hazard::ThreadRecord`: only the owning
// thread touches `retired`, so sending the table as a whole is sound.
unsafe impl Send for ThreadEpochRecord {}
unsafe impl Sync for ThreadEpochRecord {}

impl Default for ThreadEpochRecord {
    fn default() -> Self {
        ThreadEpochRecord {
            registered: AtomicBool::new(false),
            active: AtomicBool::new(false),
            local_epoch: AtomicU64::new(0),
            retired: UnsafeCell::new(Vec::new()),
            exits_since_advance: Cell::new(0),
        }
    }
}

impl ThreadEpochRecord {
    #[allow(clippy::mut_from_ref)]
    unsafe fn retired_mut(&self) -> &mut Vec<Retired> {
        unsafe { &mut *self.retired.get() }
    }
}

thread_local! {
    static SLOT_CACHE: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Epoch-based reclaimer embedded in a lock-free structure. Readers call
/// [`EpochReclaimer::pin`] to open a guarded critical section; writers call
/// [`EpochReclaimer::retire`] to hand over a node once it is unlinked.
pub struct EpochReclaimer {
    global_epoch: AtomicU64,
    records: Box<[ThreadEpochRecord]>,
    next_record_idx: AtomicUsize,
    registered_count: AtomicUsize,
}

impl Default for EpochReclaimer {
    fn default() -> Self {
        EpochReclaimer::new()
    }
}

impl EpochReclaimer {
    pub fn new() -> Self {
        EpochReclaimer {
            global_epoch: AtomicU64::new(0),
            records: (0..MAX_THREADS).map(|_| ThreadEpochRecord::default()).collect(),
            next_record_idx: AtomicUsize::new(0),
            registered_count: AtomicUsize::new(0),
        }
    }

    fn self_addr(&self) -> usize {
        self as *const _ as usize
    }

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

    /// Registers the calling thread, panicking if the fixed-size thread
    /// table is exhausted. This is the one unrecoverable failure mode in
    /// this crate: a process running more live threads against this
    /// reclaimer than it was configured for is a configuration bug, not a
    /// condition a caller could meaningfully recover from.
    fn register_new_thread(&self) -> usize {
        let idx = self.next_record_idx.fetch_add(1, Ordering::Relaxed);
        if idx < MAX_THREADS {
            self.records[idx].registered.store(true, Ordering::Release);
            self.registered_count.fetch_add(1, Ordering::Relaxed);
            return idx;
        }
        for attempt in 0..REGISTER_SCAN_ATTEMPTS {
            for (i, rec) in self.records.iter().enumerate() {
                if rec
                    .registered
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.registered_count.fetch_add(1, Ordering::Relaxed);
                    return i;
                }
            }
            if attempt % 64 == 63 {
                std::thread::yield_now();
            }
        }
        error!(
            "epoch reclaimer: exhausted {} thread epoch slots, cannot register another thread",
            MAX_THREADS
        );
        panic!(
            "EpochReclaimer: exhausted thread epoch slots (max {MAX_THREADS}); this is a \
             configuration problem, increase the max-thread-count feature"
        );
    }

    /// Enter a guarded critical section: pointers loaded from shared state
    /// while the returned guard is alive may be safely dereferenced.
    pub fn pin(&self) -> Guard<'_> {
        let idx = self.thread_record_idx();
        let e = self.global_epoch.load(Ordering::Acquire);
        self.records[idx].local_epoch.store(e, Ordering::Release);
        self.records[idx].active.store(true, Ordering::Release);
        Guard { reclaimer: self, idx }
    }

    fn compute_cleanup_threshold(&self) -> usize {
        let registered = self.registered_count.load(Ordering::Relaxed).max(1);
        (registered * CLEANUP_SCALE).clamp(MIN_CLEANUP_THRESHOLD, BASE_CLEANUP_THRESHOLD)
    }

    /// Hand a node to the reclaimer once it has been unlinked from shared
    /// state. It is freed once no guard can still observe the epoch it was
    /// retired in.
    pub fn retire(&self, ptr: *mut (), deleter: Deleter) {
        let idx = self.thread_record_idx();
        let epoch = self.global_epoch.load(Ordering::Acquire);
        let retired = unsafe { self.records[idx].retired_mut() };
        retired.push(Retired { ptr, epoch, deleter });
        if retired.len() >= self.compute_cleanup_threshold() {
            self.cleanup(idx);
        }
    }

    /// Type-safe convenience wrapper: retires a heap-allocated `T` via its
    /// normal drop glue.
    pub fn retire_boxed<T: 'static>(&self, p: *mut T) {
        self.retire(p as *mut (), Box::new(move |raw| unsafe {
            drop(Box::from_raw(raw as *mut T));
        }));
    }

    /// The minimum local epoch among currently active (pinned) threads, or
    /// `global_epoch + 1` if no thread is active — meaning nothing retired
    /// up to and including the current epoch can still be observed.
    fn safe_epoch(&self) -> u64 {
        let mut min_active: Option<u64> = None;
        for rec in self.records.iter() {
            if rec.registered.load(Ordering::Acquire) && rec.active.load(Ordering::Acquire) {
                let e = rec.local_epoch.load(Ordering::Acquire);
                min_active = Some(min_active.map_or(e, |m| m.min(e)));
            }
        }
        match min_active {
            Some(e) => e,
            None => self.global_epoch.load(Ordering::Acquire) + 1,
        }
    }

    fn try_advance_global_epoch(&self) {
        let current = self.global_epoch.load(Ordering::Acquire);
        let mut any_active = false;
        let mut min_active = u64::MAX;
        for rec in self.records.iter() {
            if rec.registered.load(Ordering::Acquire) && rec.active.load(Ordering::Acquire) {
                any_active = true;
                min_active = min_active.min(rec.local_epoch.load(Ordering::Acquire));
            }
        }
        let can_advance = !any_active || min_active >= current + 1;
        if can_advance
            && self
                .global_epoch
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            debug!("epoch reclaimer: advanced global epoch to {}", current + 1);
        }
    }

    fn cleanup(&self, idx: usize) {
        let safe = self.safe_epoch();
        let retired = unsafe { self.records[idx].retired_mut() };
        let mut i = 0;
        while i < retired.len() {
            if retired[i].epoch < safe {
                let entry = retired.swap_remove(i);
                (entry.deleter)(entry.ptr);
            } else {
                i += 1;
            }
        }
    }

    /// Force a cleanup pass against the calling thread's retired list using
    /// the current safe epoch.
    pub fn flush(&self) {
        let idx = self.thread_record_idx();
        self.cleanup(idx);
    }

    pub fn global_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    pub fn registered_threads(&self) -> usize {
        self.registered_count.load(Ordering::Relaxed)
    }

    pub fn active_threads(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.registered.load(Ordering::Acquire) && r.active.load(Ordering::Acquire))
            .count()
    }

    pub fn pending_retired(&self) -> usize {
        let idx = self.thread_record_idx();
        unsafe { self.records[idx].retired_mut().len() }
    }

    /// Point-in-time snapshot of this reclaimer's bookkeeping, for
    /// monitoring. `pending_retired` is the calling thread's own list, not a
    /// process-wide total.
    pub fn stats(&self) -> EpochStats {
        EpochStats {
            global_epoch: self.global_epoch(),
            registered_threads: self.registered_threads(),
            active_threads: self.active_threads(),
            pending_retired: self.pending_retired(),
        }
    }
}

/// RAII critical-section guard returned by [`EpochReclaimer::pin`]. Dropping
/// it marks the thread inactive again and, periodically, attempts to
/// advance the global epoch.
pub struct Guard<'a> {
    reclaimer: &'a EpochReclaimer,
    idx: usize,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let rec = &self.reclaimer.records[self.idx];
        rec.active.store(false, Ordering::Release);
        let exits = rec.exits_since_advance.get() + 1;
        if exits >= EPOCH_ADVANCE_THRESHOLD {
            rec.exits_since_advance.set(0);
            self.reclaimer.try_advance_global_epoch();
        } else {
            rec.exits_since_advance.set(exits);
        }
    }
}
