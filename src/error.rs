//! Error and status types returned by the rest of the crate.
//!
//! Every non-catastrophic failure is a typed return value, not a panic —
//! the one exception is epoch-reclaimer thread-table exhaustion, which is a
//! configuration bug, not a recoverable runtime condition, and is reported
//! by panicking (see [`crate::epoch`]).

use std::fmt;

/// Returned by a bounded queue's `try_push` when the queue is full. Carries
/// the value back to the caller so nothing is silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "queue is full")
    }
}

impl<T: fmt::Debug> std::error::Error for QueueFull<T> {}

/// Errors returned by [`crate::map::ConcurrentHashMap`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// `insert` found an existing entry for the key; the map is unchanged.
    AlreadyPresent,
    /// `erase`/`find` did not find an entry for the key.
    NotFound,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::AlreadyPresent => write!(f, "key already present"),
            MapError::NotFound => write!(f, "key not found"),
        }
    }
}

impl std::error::Error for MapError {}

/// Status returned by the hazard-pointer manager's guard acquisition. Most
/// operations cannot fail, but a double-acquire on a slot a thread already
/// holds is a caller bug worth reporting rather than silently clobbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HazardStatus {
    Success,
    /// Caller's thread already holds this slot.
    Busy,
}

impl fmt::Display for HazardStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for HazardStatus {}
