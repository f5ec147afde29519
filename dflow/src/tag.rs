//! Tags: a secondary, handle-independent dependency mechanism a task can
//! declare and a caller can wait on directly (SPEC_FULL.md §C, supplemented
//! from the original source's tag-graph feature dropped by the
//! distillation).

use dflow_fxhash::FxHashMap;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    NotReady,
    Done,
}

/// Tracks tag completion independent of the data-handle graph: a task can
/// declare it "produces" a tag, and any other part of the program can block
/// on [`TagTable::wait`] until that tag is marked done, without needing a
/// handle to synchronize on.
#[derive(Default)]
pub struct TagTable {
    state: Mutex<FxHashMap<Tag, TagState>>,
    condvar: Condvar,
}

impl TagTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `tag` done and wakes any thread blocked in [`TagTable::wait`].
    /// Idempotent: marking an already-done tag again is a no-op.
    pub fn notify(&self, tag: Tag) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.insert(tag, TagState::Done);
        self.condvar.notify_all();
    }

    /// Blocks the calling thread until `tag` has been [`TagTable::notify`]d.
    /// Returns immediately if it already has.
    pub fn wait(&self, tag: Tag) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !matches!(state.get(&tag), Some(TagState::Done)) {
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    #[must_use]
    pub fn is_done(&self, tag: Tag) -> bool {
        matches!(
            self.state.lock().unwrap_or_else(|e| e.into_inner()).get(&tag),
            Some(TagState::Done)
        )
    }
}
