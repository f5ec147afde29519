use std::sync::{Condvar, Mutex};

/// A reusable rendezvous point for a fixed number of threads.
///
/// Used for the worker-startup protocol (spec.md §4.4: "the launcher waits
/// for all workers to be initialized before returning to the application")
/// and can be re-armed, unlike a one-shot `std::sync::Barrier`.
pub struct Barrier {
    state: Mutex<State>,
    condvar: Condvar,
    num_threads: usize,
}

struct State {
    count: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult(bool);

impl Barrier {
    #[must_use]
    pub const fn new(num_threads: usize) -> Self {
        Self {
            state: Mutex::new(State {
                count: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
            num_threads,
        }
    }

    /// Blocks until `num_threads` calls to `wait` have arrived at this
    /// generation. Exactly one caller (arbitrarily chosen) is told it is
    /// the leader and is responsible for generation bookkeeping done by
    /// this method itself; callers don't need to do anything differently.
    pub fn wait(&self) -> BarrierWaitResult {
        let mut state = self.state.lock().unwrap();
        let local_gen = state.generation;
        state.count += 1;

        if state.count < self.num_threads {
            state = self
                .condvar
                .wait_while(state, |s| s.generation == local_gen)
                .unwrap();
            BarrierWaitResult(false)
        } else {
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            BarrierWaitResult(true)
        }
    }
}

impl BarrierWaitResult {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn all_threads_pass_together() {
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || barrier.wait().is_leader()));
        }
        let leaders: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(leaders, 1);
    }

    #[test]
    fn reusable_across_generations() {
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..3 {
            let b1 = Arc::clone(&barrier);
            let t = thread::spawn(move || b1.wait());
            barrier.wait();
            t.join().unwrap();
        }
    }
}
