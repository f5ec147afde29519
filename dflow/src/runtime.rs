//! The top-level application-facing API (spec.md §3, GLOSSARY "Runtime"):
//! bundles the job table, worker pool, arbiters, tags, and optional
//! distributed context behind `init`/`shutdown` lifecycle calls.

use crate::codelet::Arch;
use crate::config::Config;
use crate::distributed::{DistributedContext, ExecutionOutcome, Transport};
use crate::error::Result;
use crate::handle::{DataHandle, Owner};
use crate::job::{JobId, JobTable, Task};
use crate::sched_ctx::SchedCtxRegistry;
use crate::scheduler::{FifoSchedule, PriorityFifoSchedule, Schedule, SchedPolicyName, WorkStealingSchedule};
use crate::tag::{Tag, TagTable};
use crate::worker::WorkerPool;
use dflow_sync::{RefGate, RefGateState};
use std::sync::Arc;

/// Bundles every runtime collaborator behind a single ref-counted
/// init/shutdown gate ([`dflow_sync::RefGate`]), so nested `init`/
/// `shutdown` pairs across several call sites in an application are safe
/// (spec.md §4.4 init/teardown discipline reused for the whole runtime).
pub struct Runtime {
    gate: RefGate,
    jobs: Arc<JobTable>,
    tags: Arc<TagTable>,
    sched_ctx: Arc<SchedCtxRegistry>,
    pool: std::sync::Mutex<Option<WorkerPool>>,
    distributed: Option<DistributedContext>,
    config: Config,
}

impl Runtime {
    /// Builds and starts a runtime from `config`: spins up one worker per
    /// configured CPU slot (the only architecture this crate executes
    /// in-process, see [`crate::worker::run_job`]) and, if `transport` is
    /// given, a [`DistributedContext`] for the configured rank.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::ConfigInvalid`] if `config` requests
    /// zero total workers.
    pub fn init(config: Config, rank: Option<(i32, Arc<dyn Transport>)>) -> Result<Arc<Self>> {
        if config.total_workers() == 0 {
            return Err(crate::error::Error::ConfigInvalid(
                "configuration requests zero workers".into(),
            ));
        }

        let jobs = Arc::new(JobTable::new());
        let sched_ctx = Arc::new(SchedCtxRegistry::new());
        let schedule: Arc<dyn Schedule> = match config.sched_policy_name {
            SchedPolicyName::Fifo => Arc::new(FifoSchedule),
            SchedPolicyName::PriorityFifo => Arc::new(PriorityFifoSchedule),
            SchedPolicyName::WorkStealing => Arc::new(WorkStealingSchedule),
        };

        let mut worker_specs = Vec::with_capacity(config.total_workers());
        for i in 0..config.n_cpu {
            worker_specs.push((u32::try_from(i).unwrap_or(u32::MAX), Arch::Cpu));
        }
        let base = config.n_cpu;
        for i in 0..config.n_cuda {
            worker_specs.push((u32::try_from(base + i).unwrap_or(u32::MAX), Arch::Cuda));
        }

        let pool = WorkerPool::start(worker_specs, Arc::clone(&jobs), schedule, Arc::clone(&sched_ctx));
        let distributed = rank.map(|(r, transport)| DistributedContext::new(r, transport));

        let runtime = Arc::new(Self {
            gate: RefGate::new(),
            jobs,
            tags: Arc::new(TagTable::new()),
            sched_ctx,
            pool: std::sync::Mutex::new(Some(pool)),
            distributed,
            config,
        });
        runtime.gate.enter(|| {
            tracing::info!(workers = runtime.config.total_workers(), "runtime initialized");
        });
        Ok(runtime)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn sched_ctx(&self) -> &Arc<SchedCtxRegistry> {
        &self.sched_ctx
    }

    #[must_use]
    pub fn data_register(&self, owner: Owner) -> Arc<DataHandle> {
        DataHandle::new(owner)
    }

    #[must_use]
    pub fn data_register_with_arbiter(
        &self,
        owner: Owner,
        arbiter: Arc<crate::arbiter::Arbiter>,
    ) -> Arc<DataHandle> {
        DataHandle::new_with_arbiter(owner, arbiter)
    }

    /// Blocks until `handle` is fully idle, for deregistration
    /// (spec.md §3.1).
    pub fn data_unregister(&self, handle: &Arc<DataHandle>) {
        handle.wait_idle();
    }

    /// Submits a task locally (no distributed admission), per spec.md §3.2.
    #[must_use]
    pub fn task_submit(&self, task: Task) -> JobId {
        self.jobs.submit(task)
    }

    /// Admits a task through the distributed layer, if one was configured
    /// at [`Runtime::init`], and submits it locally if this rank is the
    /// executor (spec.md §4.5).
    ///
    /// # Errors
    ///
    /// Returns an error from [`DistributedContext::admit`].
    pub fn insert_task(&self, task: Task) -> Result<ExecutionOutcome> {
        let Some(distributed) = &self.distributed else {
            let outcome = ExecutionOutcome::Executed;
            self.jobs.submit(task);
            return Ok(outcome);
        };
        let outcome = distributed.admit(&task)?;
        if matches!(outcome, ExecutionOutcome::Executed) {
            self.jobs.submit(task);
        }
        Ok(outcome)
    }

    /// Blocks until `job` reaches [`crate::job::JobStatus::Done`].
    pub fn task_wait(&self, job: JobId) {
        let mut boff = dflow_spin::Backoff::default();
        loop {
            match self.jobs.get(job) {
                Some(j) if j.is_done() => return,
                None => return,
                Some(_) => boff.spin(),
            }
        }
    }

    /// Blocks until every job currently known to the table has completed.
    /// Intended for end-of-program drains, not for steady-state pipelines
    /// (spec.md §3.3 `task_wait_for_all`).
    pub fn task_wait_for_all(&self, jobs: &[JobId]) {
        for &id in jobs {
            self.task_wait(id);
        }
    }

    #[must_use]
    pub fn tags(&self) -> &Arc<TagTable> {
        &self.tags
    }

    pub fn tag_notify(&self, tag: Tag) {
        self.tags.notify(tag);
    }

    pub fn tag_wait(&self, tag: Tag) {
        self.tags.wait(tag);
    }

    /// Pauses worker dispatch (spec.md §6 `pause`); ref-counted, so nested
    /// pause/resume pairs compose.
    pub fn pause(&self) {
        if let Some(pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            pool.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            pool.resume();
        }
    }

    /// Drains the gate's ref count and, on the last matching call, stops
    /// every worker thread (spec.md §4.4 teardown: only the final
    /// `shutdown` actually tears anything down).
    pub fn shutdown(&self) {
        self.gate.leave(|| {
            if let Some(mut pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take() {
                pool.shutdown();
            }
            tracing::info!("runtime shut down");
        });
    }

    #[must_use]
    pub fn gate_state(&self) -> RefGateState {
        self.gate.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelet::Codelet;
    use crate::job::TaskBuilder;
    use crate::mode::AccessMode;
    use std::time::Duration;

    #[test]
    fn init_and_shutdown_round_trip() {
        let cfg = Config {
            n_cpu: 2,
            n_cuda: 0,
            ..Config::default()
        };
        let rt = Runtime::init(cfg, None).unwrap();
        assert_eq!(rt.gate_state(), RefGateState::Init);
        rt.shutdown();
        assert_eq!(rt.gate_state(), RefGateState::Uninit);
    }

    #[test]
    fn submitted_task_completes() {
        let cfg = Config {
            n_cpu: 1,
            n_cuda: 0,
            ..Config::default()
        };
        let rt = Runtime::init(cfg, None).unwrap();
        let codelet = Arc::new(Codelet::new("noop", 1).with_impl(Arch::Cpu, Arc::new(|_, _| Vec::new())));
        let h = rt.data_register(Owner::Replicated);
        let task = TaskBuilder::new().buffer(h, AccessMode::Write).build(codelet);
        let id = rt.task_submit(task);
        rt.task_wait(id);
        assert!(rt.jobs.get(id).unwrap().is_done());
        rt.shutdown();
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = Config {
            n_cpu: 0,
            n_cuda: 0,
            ..Config::default()
        };
        assert!(Runtime::init(cfg, None).is_err());
    }

    #[test]
    fn pause_blocks_new_dispatch_until_resume() {
        let cfg = Config {
            n_cpu: 1,
            n_cuda: 0,
            ..Config::default()
        };
        let rt = Runtime::init(cfg, None).unwrap();
        rt.pause();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let codelet = Arc::new(Codelet::new("flag", 1).with_impl(
            Arch::Cpu,
            Arc::new(move |_, _| {
                ran2.store(true, std::sync::atomic::Ordering::SeqCst);
                Vec::new()
            }),
        ));
        let h = rt.data_register(Owner::Replicated);
        let task = TaskBuilder::new().buffer(h, AccessMode::Write).build(codelet);
        let id = rt.task_submit(task);

        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst), "must not run while paused");

        rt.resume();
        rt.task_wait(id);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        rt.shutdown();
    }
}
