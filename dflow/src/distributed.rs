//! Distributed task admission (spec.md §4.5): deciding which rank executes
//! a task and which read buffers need shipping there first.

use crate::error::{Error, Result};
use crate::handle::{DataHandle, Owner};
use crate::job::Task;
use dflow_fxhash::{crc32_identity, FxHashMap};
use std::sync::{Arc, Mutex};

/// What a call to [`insert_task`] actually did on this rank
/// (SPEC_FULL.md §D item 1: the original's "insert_task returns an int
/// that sometimes means skipped, sometimes means an error" ambiguity is
/// resolved by splitting those into a `Result` and this enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// This rank owns the write buffer (or there is none) and executed
    /// the task locally.
    Executed,
    /// Some other rank owns the write buffer; this rank only ran the
    /// data-movement steps its own read buffers needed.
    Skipped,
}

/// A minimal point-to-point transport a distributed [`Transport`]
/// implementor provides the runtime; modeled after MPI's send/recv pair
/// (spec.md §4.5), not implemented here — this crate ships no network
/// stack, only the admission logic that decides when to call it.
pub trait Transport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the peer is unreachable or
    /// the send is rejected.
    fn send(&self, peer: i32, handle: &Arc<DataHandle>) -> Result<()>;

    /// # Errors
    ///
    /// Returns [`Error::TransportFailure`] if the peer is unreachable or
    /// the recv is rejected.
    fn recv(&self, peer: i32, handle: &Arc<DataHandle>) -> Result<()>;
}

/// Caches, per peer, which handle identities have already been shipped to
/// or from that peer, so a handle referenced by many tasks in a row is not
/// retransmitted every time (spec.md §4.5 "per-peer transfer cache keyed by
/// a 32-bit CRC hash").
#[derive(Default)]
struct TransferCache {
    sent: Mutex<FxHashMap<(i32, u32), ()>>,
}

impl TransferCache {
    fn already_sent(&self, peer: i32, key: u32) -> bool {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(peer, key))
    }

    fn mark_sent(&self, peer: i32, key: u32) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((peer, key), ());
    }

    /// Drops every peer's cached "already transferred" entry for `key`
    /// (spec.md §4.5 step 6): once a handle is written, whatever was
    /// previously shipped to or from any peer is stale, so the next read
    /// of it must transfer again regardless of which peer asks.
    fn invalidate(&self, key: u32) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|&(_, k), ()| k != key);
    }
}

/// Drives distributed admission for one rank: decides the executor for a
/// task and performs (or skips) the data movement its buffers need.
pub struct DistributedContext {
    pub rank: i32,
    transport: Arc<dyn Transport>,
    cache: TransferCache,
}

impl DistributedContext {
    #[must_use]
    pub fn new(rank: i32, transport: Arc<dyn Transport>) -> Self {
        Self {
            rank,
            transport,
            cache: TransferCache::default(),
        }
    }

    /// Admits `task` on this rank (spec.md §4.5):
    ///
    /// 1. Scan buffers for a write-ish handle's owner rank to pick the
    ///    executor, invalidating every peer's transfer-cache entry for each
    ///    write-ish handle along the way (spec.md §4.5 step 6: a write
    ///    stales whatever was previously transferred). Two write-ish
    ///    buffers with conflicting owner ranks is a [`Error::Coherence`]
    ///    violation.
    /// 2. If this rank is not the executor, still receive/send any read
    ///    buffer this rank needs to hand off or keep current, then report
    ///    [`ExecutionOutcome::Skipped`].
    /// 3. If this rank is the executor, pull in remote read buffers it
    ///    needs, then report [`ExecutionOutcome::Executed`] so the caller
    ///    submits it to the local job table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coherence`] on conflicting write-buffer owners, or
    /// [`Error::TransportFailure`] if a required transfer fails.
    pub fn admit(&self, task: &Task) -> Result<ExecutionOutcome> {
        let mut executor: Option<i32> = None;
        for b in &task.buffers {
            if !b.mode.is_write_ish() {
                continue;
            }
            // This buffer is about to change, so any peer's cached
            // transfer of its old contents is now stale.
            let key = crc32_identity(usize::try_from(b.handle.identity().0).unwrap_or(usize::MAX));
            self.cache.invalidate(key);

            let owner = match b.handle.owner() {
                Owner::Rank(r) => r,
                Owner::Replicated => continue,
            };
            match executor {
                None => executor = Some(owner),
                Some(existing) if existing != owner => {
                    return Err(Error::Coherence {
                        handle: b.handle.identity().0,
                        first: existing,
                        second: owner,
                    });
                }
                Some(_) => {}
            }
        }
        let executor = executor.unwrap_or(self.rank);

        for b in &task.buffers {
            if !b.mode.is_read_ish() {
                continue;
            }
            let owner = match b.handle.owner() {
                Owner::Rank(r) => r,
                Owner::Replicated => continue,
            };
            let key = crc32_identity(usize::try_from(b.handle.identity().0).unwrap_or(usize::MAX));

            if executor == self.rank && owner != self.rank {
                if !self.cache.already_sent(owner, key) {
                    self.transport.recv(owner, &b.handle)?;
                    self.cache.mark_sent(owner, key);
                }
            } else if executor != self.rank && owner == self.rank {
                if !self.cache.already_sent(executor, key) {
                    self.transport.send(executor, &b.handle)?;
                    self.cache.mark_sent(executor, key);
                }
            }
        }

        if executor == self.rank {
            Ok(ExecutionOutcome::Executed)
        } else {
            Ok(ExecutionOutcome::Skipped)
        }
    }
}
