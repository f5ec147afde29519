//! Worker lifecycle and the per-worker execution loop (spec.md §3.4, §6
//! `pause`/`resume`).
//!
//! One OS thread per worker. Startup is sequential: each thread signals its
//! own "I am running" before the pool waits for every worker to reach that
//! point at a shared [`dflow_sync::Barrier`] rendezvous, so no task is
//! dispatched until the whole pool is up. Sleep/wake uses a condvar
//! `notify_all` (broadcast), never `notify_one`, since more than one
//! sleeping worker may need to recheck the ready queue after a single job
//! completes and frees several handles at once.

use crate::codelet::Arch;
use crate::job::{Job, JobTable};
use crate::sched_ctx::SchedCtxRegistry;
use crate::scheduler::Schedule;
use dflow_sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The lifecycle state of a single worker thread (spec.md §3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Initializing = 0,
    Sleeping = 1,
    WakingUp = 2,
    Executing = 3,
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Sleeping,
            2 => Self::WakingUp,
            3 => Self::Executing,
            _ => Self::Terminated,
        }
    }
}

/// Cheap, lock-free state readout for status reporting; transitions that
/// need to wake a sleeper still go through [`WorkerPool`]'s condvar.
struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    fn new(s: WorkerState) -> Self {
        Self(AtomicU8::new(s as u8))
    }

    fn set(&self, s: WorkerState) {
        self.0.store(s as u8, Ordering::Release);
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }
}

pub struct WorkerHandle {
    pub id: u32,
    pub arch: Arch,
    state: Arc<AtomicWorkerState>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }
}

/// Per-worker wake channel: a worker sleeps here (not just on the job
/// table's condvar) so `resume` can wake a worker that has no runnable job
/// yet but must recheck the pause flag.
struct WakeCell {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeCell {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn wait_timeout(&self, timeout: Duration) {
        let guard = self.mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.condvar.wait_timeout(guard, timeout);
    }

    fn wake_all(&self) {
        self.condvar.notify_all();
    }
}

/// Manages the worker thread pool: startup rendezvous, dispatch loop,
/// pause/resume, and graceful shutdown.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
    /// `0` means running normally; `> 0` means paused at that nesting
    /// depth (spec.md §6 `pause`/`resume` are ref-counted, matching
    /// [`dflow_sync::RefGate`]'s nested init/teardown discipline).
    pause_depth: Arc<Mutex<usize>>,
    pause_condvar: Arc<Condvar>,
    wake: Arc<WakeCell>,
}

impl WorkerPool {
    /// Spawns one thread per `(id, arch)` pair in `workers`, blocking the
    /// calling thread until every spawned worker has reached the shared
    /// startup barrier (spec.md §3.4 "sequential startup, then a
    /// rendezvous").
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn start(
        workers: Vec<(u32, Arch)>,
        job_table: Arc<JobTable>,
        schedule: Arc<dyn Schedule>,
        sched_ctx: Arc<SchedCtxRegistry>,
    ) -> Self {
        let n = workers.len();
        let barrier = Arc::new(Barrier::new(n.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let pause_depth = Arc::new(Mutex::new(0usize));
        let pause_condvar = Arc::new(Condvar::new());
        let wake = Arc::new(WakeCell::new());

        let mut handles = Vec::with_capacity(n);
        for (id, arch) in workers {
            let state = Arc::new(AtomicWorkerState::new(WorkerState::Initializing));
            let thread = {
                let state = Arc::clone(&state);
                let job_table = Arc::clone(&job_table);
                let schedule = Arc::clone(&schedule);
                let sched_ctx = Arc::clone(&sched_ctx);
                let barrier = Arc::clone(&barrier);
                let shutdown = Arc::clone(&shutdown);
                let pause_depth = Arc::clone(&pause_depth);
                let pause_condvar = Arc::clone(&pause_condvar);
                let wake = Arc::clone(&wake);
                std::thread::Builder::new()
                    .name(format!("dflow-worker-{id}"))
                    .spawn(move || {
                        worker_main(
                            id,
                            arch,
                            &state,
                            &job_table,
                            schedule.as_ref(),
                            &sched_ctx,
                            &barrier,
                            &shutdown,
                            &pause_depth,
                            &pause_condvar,
                            &wake,
                        );
                    })
                    .expect("failed to spawn worker thread")
            };
            handles.push(WorkerHandle {
                id,
                arch,
                state,
                thread: Some(thread),
            });
        }

        Self {
            handles,
            shutdown,
            pause_depth,
            pause_condvar,
            wake,
        }
    }

    #[must_use]
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Increments the pause nesting depth; workers finish any job already
    /// in flight but will not pick up a new one until `resume` brings the
    /// depth back to zero (spec.md §6).
    pub fn pause(&self) {
        let mut depth = self.pause_depth.lock().unwrap_or_else(|e| e.into_inner());
        *depth += 1;
    }

    /// Decrements the pause nesting depth, waking all workers once it
    /// reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if called more times than `pause` (ref-count underflow).
    pub fn resume(&self) {
        let mut depth = self.pause_depth.lock().unwrap_or_else(|e| e.into_inner());
        *depth = depth
            .checked_sub(1)
            .unwrap_or_else(|| panic!("WorkerPool::resume without a matching pause"));
        if *depth == 0 {
            self.pause_condvar.notify_all();
            self.wake.wake_all();
        }
    }

    /// Signals shutdown and joins every worker thread. Outstanding ready
    /// jobs already in a worker's hand finish executing; no new job is
    /// picked up once this is called.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.pause_condvar.notify_all();
        self.wake.wake_all();
        for h in &mut self.handles {
            if let Some(t) = h.thread.take() {
                let _ = t.join();
            }
            h.state.set(WorkerState::Terminated);
        }
        tracing::info!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_main(
    id: u32,
    arch: Arch,
    state: &AtomicWorkerState,
    job_table: &JobTable,
    schedule: &dyn Schedule,
    sched_ctx: &SchedCtxRegistry,
    barrier: &Barrier,
    shutdown: &AtomicBool,
    pause_depth: &Mutex<usize>,
    pause_condvar: &Condvar,
    wake: &WakeCell,
) {
    tracing::debug!(worker = id, ?arch, "worker initializing");
    barrier.wait();
    tracing::debug!(worker = id, "worker pool rendezvous complete");

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        {
            let mut depth = pause_depth.lock().unwrap_or_else(|e| e.into_inner());
            while *depth > 0 && !shutdown.load(Ordering::Acquire) {
                depth = pause_condvar
                    .wait_timeout(depth, Duration::from_millis(50))
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(job) = schedule.pick(job_table, sched_ctx, id, arch) {
            state.set(WorkerState::Executing);
            run_job(&job, arch);
            job_table.complete(job.id);
        } else {
            state.set(WorkerState::Sleeping);
            wake.wait_timeout(Duration::from_millis(20));
            state.set(WorkerState::WakingUp);
        }
    }

    state.set(WorkerState::Terminated);
    tracing::debug!(worker = id, "worker terminated");
}

/// Runs a job's codelet implementation for `arch`. Only `Cpu`
/// implementations actually execute in-process (see
/// [`crate::codelet::KernelFn`]'s doc comment); a job scheduled onto a
/// non-`Cpu` worker here is a scheduler bug, since [`Schedule::pick`]
/// promises to only return jobs the worker's architecture can run.
fn run_job(job: &Job, arch: Arch) {
    let Some(kernel) = job.codelet.implementation_for(arch) else {
        crate::fatal!("worker {:?} picked job with no matching implementation", arch);
    };
    if !matches!(arch, Arch::Cpu) {
        tracing::trace!(?arch, "non-cpu implementation recorded but not executed in-process");
        return;
    }
    let _ = kernel(&[], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelet::Codelet;
    use crate::handle::{DataHandle, Owner};
    use crate::job::TaskBuilder;
    use crate::mode::AccessMode;
    use crate::scheduler::FifoSchedule;
    use crate::sched_ctx::SchedCtxRegistry;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pool_starts_and_shuts_down_cleanly() {
        let table = Arc::new(JobTable::new());
        let schedule: Arc<dyn Schedule> = Arc::new(FifoSchedule);
        let sched_ctx = Arc::new(SchedCtxRegistry::new());
        let mut pool = WorkerPool::start(vec![(0, Arch::Cpu), (1, Arch::Cpu)], table, schedule, sched_ctx);
        assert_eq!(pool.workers().len(), 2);
        pool.shutdown();
        for w in pool.workers() {
            assert_eq!(w.state(), WorkerState::Terminated);
        }
    }

    #[test]
    fn submitted_job_executes_and_completes() {
        let table = Arc::new(JobTable::new());
        let schedule: Arc<dyn Schedule> = Arc::new(FifoSchedule);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let codelet = Arc::new(Codelet::new("incr", 1).with_impl(
            Arch::Cpu,
            Arc::new(move |_, _| {
                ran2.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            }),
        ));

        let h = DataHandle::new(Owner::Replicated);
        let task = TaskBuilder::new().buffer(h, AccessMode::Write).build(codelet);
        let id = table.submit(task);

        let sched_ctx = Arc::new(SchedCtxRegistry::new());
        let mut pool = WorkerPool::start(vec![(0, Arch::Cpu)], Arc::clone(&table), schedule, sched_ctx);

        let mut waited = Duration::ZERO;
        while !table.get(id).unwrap().is_done() && waited < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert!(table.get(id).unwrap().is_done());
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        pool.shutdown();
    }
}
