//! Growable Michael-Scott linked-list queues. Every variant keeps a dummy
//! head node so `head` and `tail` are never null; multi-consumer variants
//! protect the node they're about to unlink with [`HazardPointerManager`]
//! before touching it, single-consumer variants don't need to (there's no
//! other thread racing to free it out from under them).
//!
//! [`UnboundedMpmc`] additionally needs `try_pop` to check `head == tail`
//! before retiring: in that transient state the node at `head` may still be
//! the node a concurrent `push` is dereferencing as `tail`, so the only
//! safe move is to help `tail` catch up and retry rather than unlink.
//! [`UnboundedSpmc`] doesn't need this check — its single producer never
//! contends over `tail` with a CAS, so there's no race for it to guard
//! against.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hazard::HazardPointerManager;
use crate::util::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }

    fn with_value(value: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }))
    }
}

/// Single-producer, single-consumer unbounded queue. Producer and consumer
/// each own one end and never contend with each other over an atomic RMW.
pub struct UnboundedSpsc<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for UnboundedSpsc<T> {}
unsafe impl<T: Send> Sync for UnboundedSpsc<T> {}

impl<T> UnboundedSpsc<T> {
    pub fn new() -> Self {
        let dummy = Node::dummy();
        UnboundedSpsc {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            len: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Called from the single producer thread only. Never fails: the queue
    /// grows to fit.
    pub fn push(&self, value: T) {
        let n = Node::with_value(value);
        let prev = self.tail.load(Ordering::Relaxed);
        unsafe {
            (*prev).next.store(n, Ordering::Release);
        }
        self.tail.store(n, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Called from the single consumer thread only.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let value = unsafe { (*next).value.get().read().assume_init() };
        self.head.store(next, Ordering::Release);
        unsafe {
            drop(Box::from_raw(head));
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Approximate occupancy (see module docs on why an exact count under
    /// concurrency isn't meaningful for multi-party queues; for SPSC this one
    /// happens to be exact as observed from either endpoint).
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for UnboundedSpsc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedSpsc<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        unsafe {
            drop(Box::from_raw(*self.head.get_mut()));
        }
    }
}

/// Multi-producer, single-consumer unbounded queue. Producers CAS-append and
/// help advance `tail` for each other; the sole consumer needs no hazard
/// protection since no other thread can free the node it's reading.
pub struct UnboundedMpsc<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for UnboundedMpsc<T> {}
unsafe impl<T: Send> Sync for UnboundedMpsc<T> {}

impl<T> UnboundedMpsc<T> {
    pub fn new() -> Self {
        let dummy = Node::dummy();
        UnboundedMpsc {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            len: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Safe to call from any number of producer threads concurrently.
    pub fn push(&self, value: T) {
        let n = Node::with_value(value);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                let cas = unsafe {
                    (*tail)
                        .next
                        .compare_exchange(ptr::null_mut(), n, Ordering::AcqRel, Ordering::Relaxed)
                };
                if cas.is_ok() {
                    let _ = self.tail.compare_exchange(tail, n, Ordering::AcqRel, Ordering::Relaxed);
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
            }
        }
    }

    /// Called from the single consumer thread only.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let value = unsafe { (*next).value.get().read().assume_init() };
        self.head.store(next, Ordering::Release);
        unsafe {
            drop(Box::from_raw(head));
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for UnboundedMpsc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedMpsc<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        unsafe {
            drop(Box::from_raw(*self.head.get_mut()));
        }
    }
}

/// Single-producer, multi-consumer unbounded queue. The single producer
/// appends linearly; consumers race over `head` under hazard-pointer
/// protection exactly like the MPMC consumer side.
pub struct UnboundedSpmc<T: 'static> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    hazard: HazardPointerManager<Node<T>>,
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for UnboundedSpmc<T> {}
unsafe impl<T: Send> Sync for UnboundedSpmc<T> {}

impl<T: 'static> UnboundedSpmc<T> {
    pub fn new() -> Self {
        let dummy = Node::dummy();
        UnboundedSpmc {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            hazard: HazardPointerManager::new(),
            len: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Called from the single producer thread only.
    pub fn push(&self, value: T) {
        let n = Node::with_value(value);
        let prev = self.tail.load(Ordering::Relaxed);
        unsafe {
            (*prev).next.store(n, Ordering::Release);
        }
        self.tail.store(n, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Safe to call from any number of consumer threads concurrently.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head = self.hazard.acquire(0, &self.head);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                self.hazard.clear(0);
                return None;
            }
            self.hazard.protect(1, next);
            if self.head.load(Ordering::Acquire) != head {
                self.hazard.clear(1);
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*next).value.get().read().assume_init() };
                self.hazard.clear(0);
                self.hazard.clear(1);
                self.hazard.retire(head);
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(value);
            }
            self.hazard.clear(1);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for UnboundedSpmc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedSpmc<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        unsafe {
            drop(Box::from_raw(*self.head.get_mut()));
        }
        self.hazard.drain();
    }
}

/// Multi-producer, multi-consumer unbounded queue: CAS-append producers,
/// hazard-protected consumers.
pub struct UnboundedMpmc<T: 'static> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    hazard: HazardPointerManager<Node<T>>,
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for UnboundedMpmc<T> {}
unsafe impl<T: Send> Sync for UnboundedMpmc<T> {}

impl<T: 'static> UnboundedMpmc<T> {
    pub fn new() -> Self {
        let dummy = Node::dummy();
        UnboundedMpmc {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            hazard: HazardPointerManager::new(),
            len: CachePadded(AtomicUsize::new(0)),
        }
    }

    /// Safe to call from any number of producer threads concurrently.
    /// Hazard-protects `tail` (slot 2, disjoint from the consumer side's
    /// slots 0/1) before dereferencing it: `try_pop` never retires a node
    /// while it's still `head == tail`, so in principle no producer can
    /// race a reclaim of the node it's reading here, but the protection
    /// costs nothing and removes that invariant as a precondition.
    pub fn push(&self, value: T) {
        let n = Node::with_value(value);
        loop {
            let tail = self.hazard.acquire(2, &self.tail);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                let cas = unsafe {
                    (*tail)
                        .next
                        .compare_exchange(ptr::null_mut(), n, Ordering::AcqRel, Ordering::Relaxed)
                };
                if cas.is_ok() {
                    let _ = self.tail.compare_exchange(tail, n, Ordering::AcqRel, Ordering::Relaxed);
                    self.hazard.clear(2);
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
            }
        }
    }

    /// Safe to call from any number of consumer threads concurrently. When
    /// `head == tail`, the node at `head` is the one a producer may be
    /// mid-dereference of as `tail`: unlinking and retiring it here would
    /// free a node a producer is still reading, so this state only ever
    /// helps `tail` along and retries rather than popping.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head = self.hazard.acquire(0, &self.head);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { self.hazard.acquire(1, &(*head).next) };

            if head == tail {
                if next.is_null() {
                    self.hazard.clear(0);
                    self.hazard.clear(1);
                    return None;
                }
                let _ = self.tail.compare_exchange(tail, next, Ordering::AcqRel, Ordering::Relaxed);
                self.hazard.clear(0);
                self.hazard.clear(1);
                continue;
            }

            if next.is_null() {
                self.hazard.clear(0);
                self.hazard.clear(1);
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*next).value.get().read().assume_init() };
                self.hazard.clear(0);
                self.hazard.clear(1);
                self.hazard.retire(head);
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(value);
            }
            self.hazard.clear(1);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for UnboundedMpmc<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UnboundedMpmc<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        unsafe {
            drop(Box::from_raw(*self.head.get_mut()));
        }
        self.hazard.drain();
    }
}
