//! dflow: a runtime for scheduling dataflow tasks across a heterogeneous
//! worker pool.
//!
//! Application code registers [`handle::DataHandle`]s for the data it owns,
//! builds [`job::Task`]s that declare which handles they touch and under
//! what [`mode::AccessMode`], and submits them through a [`runtime::Runtime`].
//! The runtime tracks each handle's coherency state, dispatches ready tasks
//! to worker threads, and — for [`mode::AccessMode::Commute`] buffers bound
//! to an [`arbiter::Arbiter`] — resolves atomic multi-handle acquisition
//! without risking the lock-ordering deadlocks a naive per-handle scheme
//! would hit.
//!
//! See [`runtime::Runtime::init`] for the entry point.

pub mod arbiter;
pub mod codelet;
pub mod config;
pub mod distributed;
pub mod error;
pub mod handle;
pub mod job;
pub mod mode;
pub mod perfmodel;
pub mod sched_ctx;
pub mod scheduler;
pub mod tag;
pub mod worker;
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::Runtime;
