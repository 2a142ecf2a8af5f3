//! Lock-free concurrency primitives: typed atomics and cache-line padding,
//! a hazard-pointer manager, an epoch-based reclaimer, a family of eight
//! lock-free queues, and a sharded concurrent hash map built on top of them.
//!
//! Every reclamation scheme here is embedded per-instance — a queue or map
//! owns its own hazard/epoch table rather than sharing one process-wide
//! singleton, so multiple independent structures never contend over the
//! same bookkeeping.

pub mod epoch;
pub mod error;
pub mod hazard;
pub mod map;
pub mod queue;
mod spin_lock;
pub mod util;
