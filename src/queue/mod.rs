//! A family of lock-free queues, one for each combination of producer/
//! consumer cardinality (SPSC/MPSC/SPMC/MPMC) and storage discipline
//! (bounded ring buffer / unbounded linked list).
//!
//! Naming mirrors the teacher's `SafeQueues.hpp` aliases: `Bounded<Roles>`
//! and `Unbounded<Roles>`, e.g. [`BoundedMpmc`], [`UnboundedSpsc`].
//!
//! Bounded queues use Dmitry Vyukov's ring-buffer algorithm (per-cell
//! sequence numbers, no ABA-prone tagged pointers needed); unbounded queues
//! use the Michael-Scott linked-list algorithm, with [`crate::hazard`]
//! protecting the consumer side whenever more than one consumer exists.

mod bounded;
mod unbounded;

pub use bounded::{BoundedMpmc, BoundedMpsc, BoundedSpmc, BoundedSpsc};
pub use unbounded::{UnboundedMpmc, UnboundedMpsc, UnboundedSpmc, UnboundedSpsc};
