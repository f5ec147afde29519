//! The commute-mode arbiter: centralized, atomic multi-handle acquisition
//! for a group of handles accessed in [`AccessMode::Commute`]
//! (spec.md §4.2).
//!
//! An arbiter holds no back-references to the handles it governs — it only
//! acts on handles passed to it as parameters by the job layer — which is
//! how this crate avoids the handle → arbiter → handle waiter reference
//! cycle spec.md's design notes call out.

use crate::handle::{CommuteWaiter, DataHandle};
use crate::job::JobId;
use dflow_fxhash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_ARBITER_ID: AtomicU64 = AtomicU64::new(1);

/// The stable sort key used to group a job's arbiter-governed buffers
/// contiguously in its buffer list (spec.md §4.2, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupKey(pub u64);

pub enum ArbiterOutcome {
    Taken,
    Queued,
}

/// A centralized mutual-exclusion point for a set of handles that must be
/// acquired together under commute semantics, avoiding the deadlock a
/// per-handle lock-ordering scheme would risk for dining-philosophers-style
/// groups (spec.md §4.2).
pub struct Arbiter {
    id: u64,
    /// Guards the whole group-acquisition decision: only one thread may be
    /// attempting a `submit` (or running `notify`) against this arbiter's
    /// handles at a time. Also guards `pending_groups`.
    guard: Mutex<PendingGroups>,
}

#[derive(Default)]
struct PendingGroups(FxHashMap<JobId, Vec<Arc<DataHandle>>>);

impl Arbiter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ARBITER_ID.fetch_add(1, Ordering::Relaxed),
            guard: Mutex::new(PendingGroups::default()),
        })
    }

    pub(crate) fn sort_key(&self) -> u64 {
        self.id
    }

    /// Attempts to atomically acquire every handle in `handles` for `job`
    /// in commute mode (spec.md §4.2 `submit`):
    ///
    /// 1. Lock the arbiter.
    /// 2. Try to reserve each handle with
    ///    [`DataHandle::try_commute_acquire`], in order.
    /// 3. If all succeed, the group is taken immediately.
    /// 4. If any fails, fully revert every reservation made in this
    ///    attempt, then enqueue the whole group on every handle's
    ///    `commute_waiters` list and return `Queued` (SPEC_FULL.md §D:
    ///    simplified from the spec's "or bump busy_count for any not
    ///    already bumped" into a uniform full-group revert-then-enqueue).
    #[must_use]
    pub fn submit(&self, job: JobId, handles: Vec<Arc<DataHandle>>) -> ArbiterOutcome {
        let mut pending = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        let mut reserved = Vec::with_capacity(handles.len());
        for h in &handles {
            if h.try_commute_acquire(crate::mode::AccessMode::Commute) {
                reserved.push(Arc::clone(h));
            } else {
                break;
            }
        }

        if reserved.len() == handles.len() {
            tracing::trace!(arbiter = self.id, job = ?job, "commute group acquired");
            return ArbiterOutcome::Taken;
        }

        for h in &reserved {
            h.revert_commute_reserve();
        }
        for h in &handles {
            h.commute_enqueue(CommuteWaiter { job });
        }
        pending.0.insert(job, handles);
        tracing::trace!(arbiter = self.id, job = ?job, "commute group queued");
        ArbiterOutcome::Queued
    }

    /// Walks each handle's commute waiter list looking for a job whose
    /// *entire* group of handles (all of which must also be governed by
    /// this arbiter, per one group per arbiter) is now free, and promotes
    /// the first such job found, in FIFO order across the union of the
    /// handles' queues (spec.md §4.2 `notify`).
    ///
    /// Called by the job layer whenever a handle governed by this arbiter
    /// becomes idle (its normal refcnt/busy_count drops to zero) — since a
    /// commute group can only be granted once every handle it needs is
    /// both idle and uncontended by ordinary acquisitions.
    pub fn notify(&self, handles: &[Arc<DataHandle>], job_table: &crate::job::JobTable) {
        let mut pending = self.guard.lock().unwrap_or_else(|e| e.into_inner());

        let mut candidates: Vec<JobId> = Vec::new();
        for h in handles {
            for w in h.commute_waiters_snapshot() {
                if !candidates.contains(&w.job) {
                    candidates.push(w.job);
                }
            }
        }

        for job_id in candidates {
            // The waiting job's *full* group may reach beyond `handles`
            // (the handles this particular release touched), so the
            // group to re-attempt is looked up from what `submit` recorded
            // when it queued this job, not reconstructed from `handles`.
            let Some(group) = pending.0.get(&job_id).cloned() else {
                continue;
            };

            let mut reserved = Vec::with_capacity(group.len());
            for h in &group {
                if h.try_commute_acquire(crate::mode::AccessMode::Commute) {
                    reserved.push(Arc::clone(h));
                } else {
                    break;
                }
            }
            if reserved.len() == group.len() {
                for h in &group {
                    h.remove_commute_waiter(job_id);
                }
                pending.0.remove(&job_id);
                drop(pending);
                job_table.on_arbiter_group_granted(job_id);
                tracing::trace!(arbiter = self.id, job = ?job_id, "commute group promoted");
                return;
            }
            for h in &reserved {
                h.revert_commute_reserve();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Owner;
    use crate::job::JobId;

    #[test]
    fn two_handle_group_acquires_atomically_or_not_at_all() {
        let arbiter = Arbiter::new();
        let a = DataHandle::new_with_arbiter(Owner::Replicated, Arc::clone(&arbiter));
        let b = DataHandle::new_with_arbiter(Owner::Replicated, Arc::clone(&arbiter));

        // Take `a` alone via a plain commute reservation, simulating
        // another arbiter-group holder.
        assert!(a.try_commute_acquire(crate::mode::AccessMode::Commute));

        let outcome = arbiter.submit(JobId::for_test(1), vec![Arc::clone(&a), Arc::clone(&b)]);
        assert!(matches!(outcome, ArbiterOutcome::Queued));
        // `b` must not have been left reserved.
        assert_eq!(b.busy_count(), 1, "b was reserved then reverted, one enqueue bump remains");
        assert_eq!(b.commute_waiters_len(), 1);
    }
}
