//! Small primitives shared by every other module: cache-line padding, a
//! process-wide thread id, CPU backoff, and memory fences.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use cfg_if::cfg_if;

/// Cache-line size assumed for padding. 64 bytes covers essentially every
/// current x86_64/aarch64 part; platforms with wider lines merely pay for
/// some avoidable sharing, they don't misbehave.
pub const CACHE_LINE_SIZE: usize = 64;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        /// Maximum number of distinct threads that may register with a
        /// single hazard-pointer manager or epoch reclaimer instance.
        pub const MAX_THREADS: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREADS: usize = 256;
    } else {
        pub const MAX_THREADS: usize = 16;
    }
}

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(0);

thread_local! {
    static THREAD_ID: Cell<i64> = const { Cell::new(-1) };
}

/// A small, stable, per-process identifier for the calling thread, assigned
/// on first use. Used to index into fixed-size per-thread tables (hazard
/// records, epoch records) without needing `std::thread::Thread` identity.
pub fn get_thread_id() -> i64 {
    THREAD_ID.with(|tid| {
        if tid.get() == -1 {
            tid.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

/// Cache-line-aligned wrapper to keep independently-written fields (e.g. two
/// queues' head/tail indices) from sharing a cache line and thrashing each
/// other under contention (false sharing).
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T>(pub T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Hint to the CPU that we're in a busy-wait spin loop, so it can de-prioritize
/// this hardware thread (`pause`/`yield` on the platforms that support it).
#[inline]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

#[inline]
pub fn acquire_fence() {
    std::sync::atomic::fence(Ordering::Acquire);
}

#[inline]
pub fn release_fence() {
    std::sync::atomic::fence(Ordering::Release);
}

#[inline]
pub fn full_fence() {
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Microseconds elapsed since `start`, used to throttle how often a cached
/// value (e.g. the reclaimer's minimum observed epoch) is recomputed.
#[inline]
pub fn micros_since(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}
