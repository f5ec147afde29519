//! Worker-side scheduling policy: which ready job a given idle worker picks
//! up next (spec.md §3.4 `Schedule`).
//!
//! The job table's ready queue already gives a FIFO baseline; a
//! [`Schedule`] implementation is free to reorder or filter what it hands
//! back, e.g. to respect priorities or per-architecture affinity.

use crate::codelet::Arch;
use crate::job::{Job, JobTable};
use crate::sched_ctx::SchedCtxRegistry;
use std::str::FromStr;
use std::sync::Arc;

/// Whether `job` may run on `worker_id`: jobs with no scheduling context
/// are unrestricted; jobs pinned to a context may only run on a worker in
/// that context's worker-id set (spec.md §3.5). A context that has since
/// been deleted (or never existed) no longer constrains anything, rather
/// than stranding the job forever.
fn job_allowed(job: &Job, sched_ctx: &SchedCtxRegistry, worker_id: u32) -> bool {
    let Some(ctx) = job.sched_ctx else { return true };
    match sched_ctx.workers_of(ctx) {
        Some(ids) => ids.contains(&worker_id),
        None => true,
    }
}

/// The named policies selectable via [`crate::config::Config`]
/// (spec.md §6 `sched_policy_name`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicyName {
    /// Plain FIFO admission order, filtered by architecture support.
    Fifo,
    /// FIFO order broken by priority (higher `priority` first).
    PriorityFifo,
    /// Idle workers steal from a randomly chosen peer when their own
    /// queue is empty (spec.md GLOSSARY "work-stealing").
    WorkStealing,
}

impl FromStr for SchedPolicyName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "prio" | "priority" | "priority-fifo" => Ok(Self::PriorityFifo),
            "ws" | "work-stealing" => Ok(Self::WorkStealing),
            other => Err(format!("unknown scheduling policy {other:?}")),
        }
    }
}

/// Picks the next job a worker of architecture `arch` should run, given
/// the shared job table and scheduling-context registry. Implementations
/// must only return jobs whose codelet has an implementation for `arch`
/// and whose scheduling context (if any) includes `worker_id`; the worker
/// loop treats [`None`] as "nothing runnable right now, go back to sleep".
pub trait Schedule: Send + Sync {
    fn pick(
        &self,
        table: &JobTable,
        sched_ctx: &SchedCtxRegistry,
        worker_id: u32,
        arch: Arch,
    ) -> Option<Arc<Job>>;
}

/// The default policy: pop the table's FIFO ready queue, skipping jobs this
/// worker's architecture cannot execute or that are pinned to a different
/// scheduling context (they are pushed to the back for a different worker
/// to find, matching the teacher's MPSC work-stealing deque discipline of
/// never dropping skipped work).
pub struct FifoSchedule;

impl Schedule for FifoSchedule {
    fn pick(
        &self,
        table: &JobTable,
        sched_ctx: &SchedCtxRegistry,
        worker_id: u32,
        arch: Arch,
    ) -> Option<Arc<Job>> {
        table.pop_ready_for_arch(arch, |job| job_allowed(job, sched_ctx, worker_id))
    }
}

/// FIFO order broken by priority: among the jobs this worker could run
/// right now, picks the one with the highest [`Job::priority`]
/// (SPEC_FULL.md §C).
pub struct PriorityFifoSchedule;

impl Schedule for PriorityFifoSchedule {
    fn pick(
        &self,
        table: &JobTable,
        sched_ctx: &SchedCtxRegistry,
        worker_id: u32,
        arch: Arch,
    ) -> Option<Arc<Job>> {
        table.pop_ready_by_priority(arch, |job| job_allowed(job, sched_ctx, worker_id))
    }
}

/// Picks from a randomized offset into the ready queue rather than always
/// the head, so many workers racing an empty local backlog spread out
/// across the runnable set instead of serializing on the same job
/// (spec.md §6 `sched_policy_name = "ws"`).
pub struct WorkStealingSchedule;

impl Schedule for WorkStealingSchedule {
    fn pick(
        &self,
        table: &JobTable,
        sched_ctx: &SchedCtxRegistry,
        worker_id: u32,
        arch: Arch,
    ) -> Option<Arc<Job>> {
        table.pop_ready_for_arch_random(arch, |job| job_allowed(job, sched_ctx, worker_id))
    }
}
