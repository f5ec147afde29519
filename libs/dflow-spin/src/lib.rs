//! Spinlock primitives for dflow's hot, short-held locks.
//!
//! [`DataHandle::header_lock`](../dflow/struct.DataHandle.html) and the
//! arbiter's reservation bookkeeping are held only across a handful of
//! pointer-sized field updates and are never held across a blocking wait, so
//! a spinlock with exponential backoff is cheaper than parking a thread on
//! a futex for every acquisition.

mod backoff;
mod mutex;

pub use backoff::Backoff;
pub use mutex::{Mutex, MutexGuard};
