use std::sync::{Condvar, Mutex};

/// Tri-state of a [`RefGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefGateState {
    Uninit,
    Changing,
    Init,
}

/// A reference-counted init/teardown gate.
///
/// Mirrors spec.md §4.4 "Reference-counted initialization": nested
/// `init`/`shutdown` calls are supported via an init-count guarded by a
/// mutex/condvar; only the call that takes the count from 0 to 1 performs
/// the real `UNINIT -> CHANGING -> INIT` transition (running the supplied
/// closure while concurrent callers block on `Changing`), and only the
/// call that takes it back to 0 performs the reverse.
///
/// Also used, with `enter`/`leave` renamed in spirit to `pause`/`resume`
/// at the call site, to implement the balanced `pause()`/`resume()` pair
/// from spec.md §6 and §8 ("repeated `pause()` calls are balanced by the
/// same number of `resume()` calls").
pub struct RefGate {
    state: Mutex<Inner>,
    condvar: Condvar,
}

struct Inner {
    state: RefGateState,
    count: usize,
}

impl RefGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Inner {
                state: RefGateState::Uninit,
                count: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Increments the reference count. If this call is the one that takes
    /// the count from 0 to 1, `init` is run while other callers (if any
    /// arrive concurrently) block until it completes; its return value is
    /// discarded, since all callers observe the same post-state regardless
    /// of who ran it.
    pub fn enter(&self, init: impl FnOnce()) {
        let mut inner = self.state.lock().unwrap();
        match inner.state {
            RefGateState::Init => {
                inner.count += 1;
            }
            RefGateState::Changing => {
                inner = self
                    .condvar
                    .wait_while(inner, |i| i.state == RefGateState::Changing)
                    .unwrap();
                inner.count += 1;
            }
            RefGateState::Uninit => {
                inner.state = RefGateState::Changing;
                drop(inner);
                init();
                inner = self.state.lock().unwrap();
                inner.count = 1;
                inner.state = RefGateState::Init;
                self.condvar.notify_all();
            }
        }
    }

    /// Decrements the reference count. If this call takes it from 1 to 0,
    /// `teardown` is run and the gate returns to `Uninit`.
    pub fn leave(&self, teardown: impl FnOnce()) {
        let mut inner = self.state.lock().unwrap();
        assert!(inner.count > 0, "RefGate::leave without a matching enter");
        inner.count -= 1;
        if inner.count == 0 {
            inner.state = RefGateState::Changing;
            drop(inner);
            teardown();
            inner = self.state.lock().unwrap();
            inner.state = RefGateState::Uninit;
            self.condvar.notify_all();
        }
    }

    #[must_use]
    pub fn state(&self) -> RefGateState {
        self.state.lock().unwrap().state
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }
}

impl Default for RefGate {
    fn default() -> Self {
        Self::new()
    }
}
