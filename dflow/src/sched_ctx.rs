//! Scheduling contexts: named subsets of the worker pool a task can be
//! pinned to (spec.md §3.5 `SCHED_CTX`).

use dflow_fxhash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

static NEXT_CTX_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedCtxId(u32);

/// The registry mapping each live scheduling context to the worker ids
/// assigned to it. A task with no explicit context runs against the
/// implicit "all workers" context.
#[derive(Default)]
pub struct SchedCtxRegistry {
    contexts: Mutex<FxHashMap<SchedCtxId, Vec<u32>>>,
}

impl SchedCtxRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn create(&self, worker_ids: Vec<u32>) -> SchedCtxId {
        let id = SchedCtxId(NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed));
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, worker_ids);
        id
    }

    #[must_use]
    pub fn workers_of(&self, ctx: SchedCtxId) -> Option<Vec<u32>> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ctx)
            .cloned()
    }

    pub fn delete(&self, ctx: SchedCtxId) {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_context_reports_its_workers() {
        let reg = SchedCtxRegistry::new();
        let id = reg.create(vec![0, 1, 2]);
        assert_eq!(reg.workers_of(id), Some(vec![0, 1, 2]));
    }

    #[test]
    fn deleted_context_is_gone() {
        let reg = SchedCtxRegistry::new();
        let id = reg.create(vec![0]);
        reg.delete(id);
        assert_eq!(reg.workers_of(id), None);
    }
}
