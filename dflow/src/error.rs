//! Error taxonomy (spec.md §7).
//!
//! `InvariantViolation` is deliberately not a variant here: per §7 it is
//! "fatal" — an assert-style termination rather than a value the caller is
//! expected to handle, since the corrupted state it signals would otherwise
//! produce silent incorrectness. See [`crate::fatal`].

use crate::codelet::Arch;
use std::fmt;

/// A stable opaque handle/job identity, reused across error variants so
/// callers can correlate an error with the object that produced it without
/// the error type depending on `handle`/`job`.
pub type Identity = u64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no worker can execute codelet {codelet:?} (tried architectures: {tried:?})")]
    NoDevice {
        codelet: String,
        tried: Vec<Arch>,
    },

    #[error("coherence violation: task names conflicting executors for written data (handle {handle}: rank {first} vs rank {second})")]
    Coherence {
        handle: Identity,
        first: i32,
        second: i32,
    },

    #[error("transport rejected {op} of handle {handle} to/from peer {peer}: {reason}")]
    TransportFailure {
        op: &'static str,
        handle: Identity,
        peer: i32,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Raises an [`InvariantViolation`](spec.md §7): logs at `error!` and
/// terminates the process in release builds, panics in debug builds so the
/// offending call site shows up in the backtrace.
///
/// Only for states that indicate a corrupted data structure (refcnt/
/// busy_count underflow, double-assigning an arbiter, acquisition-record
/// allocation failure) — never for ordinary, recoverable error conditions.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!(invariant_violation = true, $($arg)*);
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            std::process::abort();
        }
    }};
}
