//! The data-handle coherency layer (spec.md §3.1, §4.1).

use crate::arbiter::Arbiter;
use crate::fatal;
use crate::job::JobId;
use crate::mode::{compatible, AccessMode, ModeKind};
use dflow_spin::Mutex as Spinlock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// A stable opaque identity, assigned at handle creation, used as the
/// handle's hash/sort key (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(pub u64);

/// The node rank owning a handle's data in a distributed run, or
/// `Replicated` if the data lives identically on every participant
/// (spec.md §3.1 `owner_rank`, "-1 if replicated").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Rank(i32),
    Replicated,
}

/// A single pending acquisition request queued on a handle's regular
/// waiter list (spec.md §3.1 `waiters`).
pub struct Waiter {
    pub job: JobId,
    pub buffer_index: usize,
    pub mode: AccessMode,
}

/// A pending acquisition request queued on a handle's `commute_waiters`
/// list. Only ever populated/drained by the [`Arbiter`] governing the
/// handle (spec.md §4.2).
#[derive(Clone, Copy)]
pub struct CommuteWaiter {
    pub job: JobId,
}

pub enum AcquireOutcome {
    Taken,
    Queued,
}

struct Inner {
    current_mode: Option<AccessMode>,
    refcnt: u32,
    busy_count: u32,
    waiters: VecDeque<Waiter>,
    commute_waiters: VecDeque<CommuteWaiter>,
}

/// Represents a piece of application data, opaque from the runtime's point
/// of view, with coherency state and a waiter queue (spec.md §3.1).
pub struct DataHandle {
    identity: Identity,
    owner: Owner,
    /// Fixed at handle-initialization time; `None` unless
    /// [`DataHandle::assign_arbiter`] was called before the handle was ever
    /// acquired (spec.md §3.1 invariant: "may be assigned an arbiter only
    /// while refcnt == 0 ∧ busy_count == 0").
    arbiter: Option<Arc<Arbiter>>,
    inner: Spinlock<Inner>,
}

impl DataHandle {
    #[must_use]
    pub fn new(owner: Owner) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)),
            owner,
            arbiter: None,
            inner: Spinlock::new(Inner {
                current_mode: None,
                refcnt: 0,
                busy_count: 0,
                waiters: VecDeque::new(),
                commute_waiters: VecDeque::new(),
            }),
        })
    }

    #[must_use]
    pub fn new_with_arbiter(owner: Owner, arbiter: Arc<Arbiter>) -> Arc<Self> {
        Arc::new(Self {
            identity: Identity(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)),
            owner,
            arbiter: Some(arbiter),
            inner: Spinlock::new(Inner {
                current_mode: None,
                refcnt: 0,
                busy_count: 0,
                waiters: VecDeque::new(),
                commute_waiters: VecDeque::new(),
            }),
        })
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[must_use]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    #[must_use]
    pub fn arbiter(&self) -> Option<&Arc<Arbiter>> {
        self.arbiter.as_ref()
    }

    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.inner.lock().refcnt
    }

    #[must_use]
    pub fn busy_count(&self) -> u32 {
        self.inner.lock().busy_count
    }

    #[must_use]
    pub fn current_mode(&self) -> Option<AccessMode> {
        self.inner.lock().current_mode
    }

    /// Attempts to take a reference to the handle compatible with the
    /// current state, queueing the request otherwise (spec.md §4.1
    /// `acquire`).
    ///
    /// Never called with [`AccessMode::Commute`] — commute acquisitions on
    /// an arbiter-governed handle go through [`Arbiter::submit`] instead;
    /// see [`crate::job::JobTable::submit`].
    ///
    /// # Panics
    ///
    /// Panics (aborts in release builds, via [`crate::fatal`]) if the
    /// handle's busy count would overflow `u32`, which indicates a
    /// corrupted acquisition record rather than ordinary load.
    pub fn acquire(&self, mode: AccessMode, job: JobId, buffer_index: usize) -> AcquireOutcome {
        debug_assert!(!matches!(mode, AccessMode::Commute));
        let mut inner = self.inner.lock();

        if matches!(mode, AccessMode::Scratch) {
            // Scratch buffers never contend (spec.md §4.1): they bypass
            // the refcnt-based mutual exclusion entirely and only
            // contribute to busy_count, so a concurrent write-ish holder
            // is unaffected and the `refcnt == 1` write invariant holds.
            bump_busy(&mut inner);
            return AcquireOutcome::Taken;
        }

        if inner.refcnt == 0 {
            inner.current_mode = Some(mode);
            inner.refcnt = 1;
            bump_busy(&mut inner);
            tracing::trace!(identity = self.identity.0, ?mode, "handle acquired (idle)");
            return AcquireOutcome::Taken;
        }

        if compatible(mode, inner.current_mode.expect("refcnt > 0 implies a mode")) {
            inner.refcnt += 1;
            bump_busy(&mut inner);
            tracing::trace!(identity = self.identity.0, ?mode, refcnt = inner.refcnt, "handle acquired (joined group)");
            return AcquireOutcome::Taken;
        }

        bump_busy(&mut inner);
        inner.waiters.push_back(Waiter {
            job,
            buffer_index,
            mode,
        });
        tracing::trace!(identity = self.identity.0, ?mode, "handle acquisition queued");
        AcquireOutcome::Queued
    }

    /// Releases one reference held by `job`. Returns the waiters promoted
    /// as a result, in FIFO order, per the head-group aggregation policy
    /// (spec.md §4.1 "Promotion policy on release").
    ///
    /// The caller (the job layer) is responsible for calling
    /// `JobTable::release_dep` for each promoted waiter's job.
    ///
    /// # Panics
    ///
    /// Panics (aborts in release builds, via [`crate::fatal`]) if `refcnt`
    /// is already zero, which means a caller released a reference it never
    /// held — a corrupted coherency state, never an ordinary condition.
    pub fn release(&self, _job: JobId) -> Vec<Waiter> {
        let mut inner = self.inner.lock();
        if inner.refcnt == 0 {
            fatal!("refcnt underflow on handle {}", self.identity.0);
        }
        inner.refcnt -= 1;
        inner.busy_count -= 1;

        if inner.refcnt > 0 {
            return Vec::new();
        }

        let Some(head) = inner.waiters.front() else {
            inner.current_mode = None;
            return Vec::new();
        };

        let head_kind = head.mode.kind();
        let mut promoted = Vec::new();
        if matches!(head_kind, ModeKind::Read | ModeKind::Reduction) {
            while let Some(front) = inner.waiters.front() {
                if front.mode.kind() == head_kind {
                    promoted.push(inner.waiters.pop_front().expect("front just matched"));
                } else {
                    break;
                }
            }
        } else {
            promoted.push(inner.waiters.pop_front().expect("front exists"));
        }

        inner.current_mode = Some(promoted[0].mode);
        inner.refcnt = u32::try_from(promoted.len()).expect("promoted group fits in u32");
        tracing::trace!(
            identity = self.identity.0,
            promoted = promoted.len(),
            "handle promotion"
        );
        promoted
    }

    /// Releases a scratch reference. Scratch acquisitions never touch
    /// `refcnt` or the waiter queue (see [`DataHandle::acquire`]), so this
    /// only retires the `busy_count` contribution.
    ///
    /// # Panics
    ///
    /// Panics (aborts in release builds, via [`crate::fatal`]) if
    /// `busy_count` is already zero.
    pub fn release_scratch(&self) {
        let mut inner = self.inner.lock();
        if inner.busy_count == 0 {
            fatal!("busy_count underflow on handle {} (scratch)", self.identity.0);
        }
        inner.busy_count -= 1;
    }

    /// Blocks the calling thread until `refcnt` reaches zero. Used during
    /// deregistration (spec.md §3.1 lifecycle: "all waiters must be
    /// drained before deregistration"). This is a cold, rare path so a
    /// spin-with-backoff is acceptable.
    pub fn wait_idle(&self) {
        let mut boff = dflow_spin::Backoff::default();
        loop {
            {
                let inner = self.inner.lock();
                if inner.refcnt == 0 && inner.busy_count == 0 {
                    return;
                }
            }
            boff.spin();
        }
    }

    // --- Arbiter-only entry points (spec.md §4.2) ---
    // The arbiter, while holding its own mutex, manipulates this handle's
    // refcnt/current_mode directly rather than through `acquire`/`release`,
    // since commute acquisitions are an all-or-nothing group decision the
    // handle itself cannot make alone. Lock order: arbiter mutex is always
    // taken before this handle's spinlock (spec.md §5).

    pub(crate) fn try_commute_acquire(&self, mode: AccessMode) -> bool {
        let mut inner = self.inner.lock();
        if inner.refcnt == 0 {
            inner.refcnt = 1;
            inner.current_mode = Some(mode);
            bump_busy(&mut inner);
            true
        } else {
            false
        }
    }

    /// Undoes a `try_commute_acquire` that must be rolled back because a
    /// sibling handle in the same atomic group could not be taken
    /// (spec.md §4.2 step 4, "release all handles reserved in this
    /// attempt").
    pub(crate) fn revert_commute_reserve(&self) {
        let mut inner = self.inner.lock();
        if inner.refcnt == 0 || inner.busy_count == 0 {
            fatal!("commute revert underflow on handle {}", self.identity.0);
        }
        inner.refcnt = 0;
        inner.current_mode = None;
        inner.busy_count -= 1;
    }

    /// Releases a successfully-held commute reference, called when the job
    /// that held it completes.
    pub(crate) fn commute_release(&self) {
        let mut inner = self.inner.lock();
        if inner.refcnt != 1 || inner.busy_count == 0 {
            fatal!("commute release invariant broken on handle {}", self.identity.0);
        }
        inner.refcnt = 0;
        inner.current_mode = None;
        inner.busy_count -= 1;
    }

    pub(crate) fn commute_enqueue(&self, waiter: CommuteWaiter) {
        let mut inner = self.inner.lock();
        bump_busy(&mut inner);
        inner.commute_waiters.push_back(waiter);
    }

    /// A FIFO snapshot of the handle's commute waiters, for the arbiter to
    /// walk while deciding who to promote (spec.md §4.2 `notify`).
    pub(crate) fn commute_waiters_snapshot(&self) -> Vec<CommuteWaiter> {
        self.inner.lock().commute_waiters.iter().copied().collect()
    }

    pub(crate) fn remove_commute_waiter(&self, job: JobId) {
        let mut inner = self.inner.lock();
        inner.commute_waiters.retain(|w| w.job != job);
    }

    #[cfg(test)]
    pub(crate) fn commute_waiters_len(&self) -> usize {
        self.inner.lock().commute_waiters.len()
    }
}

fn bump_busy(inner: &mut Inner) {
    inner.busy_count = inner
        .busy_count
        .checked_add(1)
        .unwrap_or_else(|| fatal!("busy_count overflow"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn jid(n: u64) -> JobId {
        JobId::for_test(n)
    }

    #[test]
    fn idle_to_idle_read_is_noop() {
        let h = DataHandle::new(Owner::Replicated);
        assert!(matches!(
            h.acquire(AccessMode::Read, jid(1), 0),
            AcquireOutcome::Taken
        ));
        assert_eq!(h.refcnt(), 1);
        assert!(h.release(jid(1)).is_empty());
        assert_eq!(h.refcnt(), 0);
        assert_eq!(h.busy_count(), 0);
    }

    #[test]
    fn readers_join_a_group() {
        let h = DataHandle::new(Owner::Replicated);
        for i in 0..8 {
            assert!(matches!(
                h.acquire(AccessMode::Read, jid(i), 0),
                AcquireOutcome::Taken
            ));
        }
        assert_eq!(h.refcnt(), 8);
    }

    #[test]
    fn writer_is_exclusive_and_queues_behind_readers() {
        let h = DataHandle::new(Owner::Replicated);
        h.acquire(AccessMode::Read, jid(1), 0);
        assert!(matches!(
            h.acquire(AccessMode::Write, jid(2), 0),
            AcquireOutcome::Queued
        ));
        assert_eq!(h.busy_count(), 2);
    }

    #[test]
    fn readers_after_release_promote_as_a_group() {
        let h = DataHandle::new(Owner::Replicated);
        h.acquire(AccessMode::Write, jid(0), 0);
        for i in 1..=8 {
            assert!(matches!(
                h.acquire(AccessMode::Read, jid(i), 0),
                AcquireOutcome::Queued
            ));
        }
        // A second writer behind the readers must not overtake them.
        assert!(matches!(
            h.acquire(AccessMode::Write, jid(9), 0),
            AcquireOutcome::Queued
        ));

        let promoted = h.release(jid(0));
        assert_eq!(promoted.len(), 8, "all 8 readers promote together");
        assert_eq!(h.refcnt(), 8);

        for w in &promoted {
            assert!(matches!(w.mode, AccessMode::Read));
        }
    }

    #[test]
    fn writer_never_overtakes_earlier_reader() {
        let h = DataHandle::new(Owner::Replicated);
        h.acquire(AccessMode::Write, jid(0), 0);
        h.acquire(AccessMode::Read, jid(1), 0);
        h.acquire(AccessMode::Write, jid(2), 0);
        h.acquire(AccessMode::Read, jid(3), 0);

        let promoted = h.release(jid(0));
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].job, jid(1));
    }

    #[test]
    fn scratch_never_contends_with_a_writer() {
        let h = DataHandle::new(Owner::Replicated);
        h.acquire(AccessMode::Write, jid(0), 0);
        assert!(matches!(
            h.acquire(AccessMode::Scratch, jid(1), 0),
            AcquireOutcome::Taken
        ));
        assert_eq!(h.refcnt(), 1, "scratch must not touch refcnt");
        h.release_scratch();
        assert_eq!(h.busy_count(), 1, "writer's own busy contribution remains");
    }
}
