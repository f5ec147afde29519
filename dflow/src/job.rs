//! Tasks, jobs, and the central job table (spec.md §3.2, §4.3, §4.4).
//!
//! A [`Task`] is the application-facing description; submitting one creates
//! a [`Job`], the runtime's bookkeeping record for a single execution. Jobs
//! are looked up by [`JobId`] through the [`JobTable`] rather than held by
//! `Arc` from waiter queues, to avoid the handle → arbiter → job → handle
//! reference cycle spec.md's own design notes flag.

use crate::arbiter::{ArbiterOutcome, GroupKey};
use crate::codelet::Codelet;
use crate::handle::{AcquireOutcome, DataHandle};
use crate::mode::AccessMode;
use dflow_fxhash::FxHashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

static_assertions::const_assert_eq!(std::mem::size_of::<JobId>(), std::mem::size_of::<u64>());

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_test(n: u64) -> Self {
        Self(n)
    }
}

/// One buffer argument declared on a [`Task`], pairing a handle with the
/// mode it is accessed under.
#[derive(Clone)]
pub struct BufferArg {
    pub handle: Arc<DataHandle>,
    pub mode: AccessMode,
}

/// Most codelets declare a handful of buffers (spec.md §3.2 typically
/// cites examples with 2-4), so an inline-storage vector avoids a heap
/// allocation for the common case.
pub type BufferVec = SmallVec<[BufferArg; 4]>;

/// The application-facing description of a unit of work, built via
/// [`TaskBuilder`] and turned into a [`Job`] by [`JobTable::submit`]
/// (spec.md §3.2).
pub struct Task {
    pub codelet: Arc<Codelet>,
    pub buffers: BufferVec,
    pub priority: i32,
    pub sched_ctx: Option<crate::sched_ctx::SchedCtxId>,
}

#[derive(Default)]
pub struct TaskBuilder {
    buffers: BufferVec,
    priority: i32,
    sched_ctx: Option<crate::sched_ctx::SchedCtxId>,
}

impl TaskBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn buffer(mut self, handle: Arc<DataHandle>, mode: AccessMode) -> Self {
        self.buffers.push(BufferArg { handle, mode });
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn sched_ctx(mut self, ctx: crate::sched_ctx::SchedCtxId) -> Self {
        self.sched_ctx = Some(ctx);
        self
    }

    #[must_use]
    pub fn build(self, codelet: Arc<Codelet>) -> Task {
        Task {
            codelet,
            buffers: self.buffers,
            priority: self.priority,
            sched_ctx: self.sched_ctx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting on one or more buffer acquisitions.
    Blocked,
    /// All buffers acquired; eligible for worker dispatch.
    Ready,
    /// Handed to a worker; executing its codelet.
    Executing,
    Done,
}

/// One buffer entry in a job's ordered, deduplicated buffer list
/// (spec.md §4.3).
pub(crate) struct JobBuffer {
    pub handle: Arc<DataHandle>,
    pub mode: AccessMode,
    pub taken: bool,
}

pub struct Job {
    pub id: JobId,
    pub codelet: Arc<Codelet>,
    pub priority: i32,
    /// The scheduling context this job is restricted to, if any
    /// (SPEC_FULL.md §C: contexts map to worker subsets). `None` means
    /// "any worker".
    pub sched_ctx: Option<crate::sched_ctx::SchedCtxId>,
    status: Mutex<JobStatus>,
    buffers: Mutex<Vec<JobBuffer>>,
    /// Number of buffers this job is still waiting on: one per
    /// not-yet-taken non-arbiter buffer, plus (if the job has any
    /// arbiter-governed groups) exactly one more, decremented only once
    /// all of those groups resolve (see [`JobTable::advance_arbiter_groups`]).
    dep_count: std::sync::atomic::AtomicU32,
    /// Cursor into the arbiter-governed groups this job still needs to
    /// submit, in sorted order (spec.md §4.2 "recurse on further groups").
    arbiter_groups: Mutex<VecDeque<GroupKey>>,
}

impl Job {
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status() == JobStatus::Done
    }
}

/// The runtime-wide table of live jobs, and the only owner of strong
/// references between a submitted task's dependency graph. Handles and the
/// arbiter refer to jobs only by [`JobId`]; this table is where an id is
/// resolved back to its [`Job`] (spec.md design notes on avoiding reference
/// cycles).
pub struct JobTable {
    jobs: Mutex<FxHashMap<JobId, Arc<Job>>>,
    ready: Mutex<VecDeque<JobId>>,
    condvar: std::sync::Condvar,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(FxHashMap::default()),
            ready: Mutex::new(VecDeque::new()),
            condvar: std::sync::Condvar::new(),
        }
    }

    #[must_use]
    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).get(&id).cloned()
    }

    /// Submits a task: builds the ordered/deduplicated buffer list
    /// (spec.md §4.3), attempts to acquire every non-arbiter buffer
    /// immediately, and registers the job's arbiter-governed groups for
    /// [`JobTable::advance_arbiter_groups`] to drive. Returns the new job's
    /// id; the job is `Ready` immediately if it had no buffers at all to
    /// wait on.
    ///
    /// # Panics
    ///
    /// Panics (aborts in release builds) if a handle's acquisition
    /// bookkeeping is found corrupted — see [`crate::handle::DataHandle::acquire`].
    #[must_use]
    pub fn submit(&self, task: Task) -> JobId {
        let id = JobId::next();

        let mut ordered: Vec<(usize, BufferArg)> = task
            .buffers
            .into_iter()
            .enumerate()
            .collect();
        // Composite sort key (spec.md §4.2 + §4.3): arbiter group first (0
        // for ungoverned buffers, a stable per-arbiter id otherwise), then
        // handle identity, then write-ish-before-read-ish within a handle.
        ordered.sort_by_key(|(_, b)| {
            let arbiter_key = b
                .handle
                .arbiter()
                .map_or(0u64, |a| a.sort_key());
            (arbiter_key, b.handle.identity().0, b.mode.order_rank())
        });
        // Deduplicate by handle identity, keeping the first (highest-
        // priority per order_rank) mode seen for that handle.
        let mut seen = dflow_fxhash::FxHashSet::default();
        let deduped: Vec<(usize, BufferArg)> = ordered
            .into_iter()
            .filter(|(_, b)| seen.insert(b.handle.identity()))
            .collect();

        let mut arbiter_groups: VecDeque<GroupKey> = VecDeque::new();
        let mut job_buffers = Vec::with_capacity(deduped.len());
        let mut dep_count: u32 = 0;
        let mut last_group: Option<u64> = None;

        for (_, b) in &deduped {
            if let Some(arbiter) = b.handle.arbiter() {
                let key = arbiter.sort_key();
                if last_group != Some(key) {
                    arbiter_groups.push_back(GroupKey(key));
                    last_group = Some(key);
                }
                job_buffers.push(JobBuffer {
                    handle: Arc::clone(&b.handle),
                    mode: b.mode,
                    taken: false,
                });
                continue;
            }
            last_group = None;
            match b.handle.acquire(b.mode, id, job_buffers.len()) {
                AcquireOutcome::Taken => job_buffers.push(JobBuffer {
                    handle: Arc::clone(&b.handle),
                    mode: b.mode,
                    taken: true,
                }),
                AcquireOutcome::Queued => {
                    dep_count += 1;
                    job_buffers.push(JobBuffer {
                        handle: Arc::clone(&b.handle),
                        mode: b.mode,
                        taken: false,
                    });
                }
            }
        }
        let has_arbiter_groups = !arbiter_groups.is_empty();
        if has_arbiter_groups {
            dep_count += 1;
        }

        let job = Arc::new(Job {
            id,
            codelet: task.codelet,
            priority: task.priority,
            sched_ctx: task.sched_ctx,
            status: Mutex::new(JobStatus::Blocked),
            buffers: Mutex::new(job_buffers),
            dep_count: std::sync::atomic::AtomicU32::new(dep_count),
            arbiter_groups: Mutex::new(arbiter_groups),
        });
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).insert(id, Arc::clone(&job));

        if dep_count == 0 {
            self.mark_ready(&job);
        } else if has_arbiter_groups {
            // Only drive the arbiter groups here; a job blocked purely on
            // ordinary (non-arbiter) buffers has nothing to advance until
            // the real holder releases and promotes it via `release_dep`.
            self.advance_arbiter_groups(&job);
        }
        id
    }

    /// Drives the next not-yet-submitted arbiter group for `job`, if any,
    /// by calling [`crate::arbiter::Arbiter::submit`] for that group's
    /// buffers. If the group resolves immediately, recurses on the next
    /// one in the same call; spec.md §4.2 "if further buffers belong to
    /// another arbiter, recurse on them".
    fn advance_arbiter_groups(&self, job: &Arc<Job>) {
        loop {
            let next_key = {
                let groups = job.arbiter_groups.lock().unwrap_or_else(|e| e.into_inner());
                groups.front().copied()
            };
            let Some(key) = next_key else {
                self.release_dep(job.id);
                return;
            };

            let bufs = job.buffers.lock().unwrap_or_else(|e| e.into_inner());
            let group_handles: Vec<Arc<DataHandle>> = bufs
                .iter()
                .filter(|b| b.handle.arbiter().is_some_and(|a| a.sort_key() == key.0))
                .map(|b| Arc::clone(&b.handle))
                .collect();
            let arbiter = group_handles[0]
                .arbiter()
                .expect("filtered by arbiter presence")
                .clone();
            drop(bufs);

            match arbiter.submit(job.id, group_handles) {
                ArbiterOutcome::Taken => {
                    mark_arbiter_group_taken(job, key.0);
                    job.arbiter_groups.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    // continue the loop: try the next group immediately
                }
                ArbiterOutcome::Queued => return,
            }
        }
    }

    /// Called by the arbiter once a job's group is finally granted
    /// (possibly asynchronously, from `notify`), to resume driving any
    /// remaining groups.
    pub(crate) fn on_arbiter_group_granted(&self, job_id: JobId) {
        if let Some(job) = self.get(job_id) {
            if let Some(key) = job.arbiter_groups.lock().unwrap_or_else(|e| e.into_inner()).front().copied() {
                mark_arbiter_group_taken(&job, key.0);
            }
            job.arbiter_groups.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            self.advance_arbiter_groups(&job);
        }
    }

    /// Called when a normal (non-arbiter) handle promotes a waiter on
    /// release. Marks that buffer taken and decrements the job's
    /// dep_count, moving it to `Ready` once all dependencies clear.
    pub(crate) fn release_dep(&self, job_id: JobId) {
        let Some(job) = self.get(job_id) else { return };
        let prev = job.dep_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            crate::fatal!("job {:?} dep_count underflow", job_id);
        }
        if prev == 1 {
            self.mark_ready(&job);
        }
    }

    pub(crate) fn mark_buffer_taken(&self, job_id: JobId, buffer_index: usize) {
        if let Some(job) = self.get(job_id) {
            let mut bufs = job.buffers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = bufs.get_mut(buffer_index) {
                b.taken = true;
            }
        }
    }

    fn mark_ready(&self, job: &Arc<Job>) {
        job.set_status(JobStatus::Ready);
        self.ready.lock().unwrap_or_else(|e| e.into_inner()).push_back(job.id);
        self.condvar.notify_all();
        tracing::debug!(job = ?job.id, "job ready");
    }

    /// Pops the first ready job whose codelet has an implementation for
    /// `arch` and for which `allowed` returns `true` (the scheduling-context
    /// membership check, spec.md §3.5), skipping (and re-queuing, at the
    /// back) any it cannot run. Non-blocking: returns `None` immediately if
    /// nothing runnable is currently in the ready queue.
    #[must_use]
    pub fn pop_ready_for_arch(
        &self,
        arch: crate::codelet::Arch,
        allowed: impl Fn(&Job) -> bool,
    ) -> Option<Arc<Job>> {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let len = ready.len();
        for _ in 0..len {
            let id = ready.pop_front()?;
            let Some(job) = self.get(id) else { continue };
            if job.codelet.implementation_for(arch).is_some() && allowed(&job) {
                return Some(job);
            }
            ready.push_back(id);
        }
        None
    }

    /// Like [`JobTable::pop_ready_for_arch`], but starts the scan at a
    /// random offset into the ready queue instead of always the head, so
    /// several idle workers racing this call don't pile up on the same
    /// head-of-line job when many are runnable for their architecture
    /// (spec.md GLOSSARY "work-stealing": here there is one shared ready
    /// queue rather than per-worker deques, so "stealing" takes the form
    /// of randomized pick order instead of victim-queue selection).
    #[must_use]
    pub fn pop_ready_for_arch_random(
        &self,
        arch: crate::codelet::Arch,
        allowed: impl Fn(&Job) -> bool,
    ) -> Option<Arc<Job>> {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let len = ready.len();
        if len == 0 {
            return None;
        }
        let start = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..len)
        };
        ready.rotate_left(start);
        for _ in 0..len {
            let id = ready.pop_front()?;
            let Some(job) = self.get(id) else { continue };
            if job.codelet.implementation_for(arch).is_some() && allowed(&job) {
                return Some(job);
            }
            ready.push_back(id);
        }
        None
    }

    /// Scans the whole ready queue for the highest-`priority` job whose
    /// codelet supports `arch` and for which `allowed` returns `true`,
    /// removing only that entry and leaving the rest of the queue's
    /// relative order untouched (spec.md §3.2 `priority`, SPEC_FULL.md §C:
    /// the default policy orders ready jobs by priority rather than pure
    /// FIFO). Ties are broken by FIFO position (the earliest-queued of
    /// equal priority wins), since the scan visits the queue front-to-back
    /// and only replaces the current best on a strictly greater priority.
    #[must_use]
    pub fn pop_ready_by_priority(
        &self,
        arch: crate::codelet::Arch,
        allowed: impl Fn(&Job) -> bool,
    ) -> Option<Arc<Job>> {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let mut best: Option<(usize, i32, Arc<Job>)> = None;
        for (idx, &id) in ready.iter().enumerate() {
            let Some(job) = self.get(id) else { continue };
            if job.codelet.implementation_for(arch).is_none() || !allowed(&job) {
                continue;
            }
            let beats_current = match &best {
                Some((_, p, _)) => job.priority > *p,
                None => true,
            };
            if beats_current {
                best = Some((idx, job.priority, job));
            }
        }
        let (idx, _, job) = best?;
        ready.remove(idx);
        Some(job)
    }

    /// Pops the next ready job, blocking until one is available or `pred`
    /// reports the wait should stop (used by workers to honor shutdown).
    pub fn pop_ready_blocking(&self, mut should_stop: impl FnMut() -> bool) -> Option<JobId> {
        let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(id) = ready.pop_front() {
                return Some(id);
            }
            if should_stop() {
                return None;
            }
            ready = self
                .condvar
                .wait_timeout(ready, std::time::Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Releases every buffer a completed job held, promoting any newly
    /// unblocked waiters (spec.md §4.4 completion path), then marks the
    /// job `Done`.
    ///
    /// # Panics
    ///
    /// Panics (aborts in release builds) if a released handle's
    /// refcnt/busy_count bookkeeping is found corrupted — see
    /// [`crate::handle::DataHandle::release`].
    pub fn complete(&self, job_id: JobId) {
        let Some(job) = self.get(job_id) else { return };
        let bufs = job.buffers.lock().unwrap_or_else(|e| e.into_inner());
        for b in bufs.iter() {
            if !b.taken {
                continue;
            }
            if let Some(arbiter) = b.handle.arbiter() {
                b.handle.commute_release();
                arbiter.notify(std::slice::from_ref(&b.handle), self);
                continue;
            }
            if matches!(b.mode, AccessMode::Scratch) {
                b.handle.release_scratch();
                continue;
            }
            let promoted = b.handle.release(job_id);
            for waiter in promoted {
                self.mark_buffer_taken(waiter.job, waiter.buffer_index);
                self.release_dep(waiter.job);
            }
        }
        drop(bufs);
        job.set_status(JobStatus::Done);
        tracing::debug!(job = ?job_id, "job complete");
    }
}

/// Marks every buffer in `job` belonging to the arbiter group keyed by
/// `group_key` as taken, once the arbiter has actually granted that group
/// (see [`JobTable::advance_arbiter_groups`] and
/// [`JobTable::on_arbiter_group_granted`]) — needed so
/// [`JobTable::complete`] knows to call `commute_release` for it instead of
/// skipping it as never-acquired.
fn mark_arbiter_group_taken(job: &Job, group_key: u64) {
    let mut bufs = job.buffers.lock().unwrap_or_else(|e| e.into_inner());
    for b in bufs.iter_mut() {
        if b.handle.arbiter().is_some_and(|a| a.sort_key() == group_key) {
            b.taken = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Owner;
    use std::sync::Arc;

    fn codelet() -> Arc<Codelet> {
        Arc::new(Codelet::new("noop", 1))
    }

    #[test]
    fn independent_tasks_are_immediately_ready() {
        let table = JobTable::new();
        let h = DataHandle::new(Owner::Replicated);
        let task = TaskBuilder::new()
            .buffer(h, AccessMode::Write)
            .build(codelet());
        let id = table.submit(task);
        assert_eq!(table.get(id).unwrap().status(), JobStatus::Ready);
    }

    #[test]
    fn second_writer_blocks_until_first_completes() {
        let table = JobTable::new();
        let h = DataHandle::new(Owner::Replicated);
        let t1 = TaskBuilder::new()
            .buffer(Arc::clone(&h), AccessMode::Write)
            .build(codelet());
        let t2 = TaskBuilder::new()
            .buffer(Arc::clone(&h), AccessMode::Write)
            .build(codelet());
        let id1 = table.submit(t1);
        let id2 = table.submit(t2);
        assert_eq!(table.get(id1).unwrap().status(), JobStatus::Ready);
        assert_eq!(table.get(id2).unwrap().status(), JobStatus::Blocked);

        table.complete(id1);
        assert_eq!(table.get(id2).unwrap().status(), JobStatus::Ready);
    }

    #[test]
    fn duplicate_handle_in_one_task_is_deduplicated() {
        let table = JobTable::new();
        let h = DataHandle::new(Owner::Replicated);
        let task = TaskBuilder::new()
            .buffer(Arc::clone(&h), AccessMode::Write)
            .buffer(Arc::clone(&h), AccessMode::Read)
            .build(codelet());
        let id = table.submit(task);
        let job = table.get(id).unwrap();
        assert_eq!(job.buffers.lock().unwrap().len(), 1);
    }
}
