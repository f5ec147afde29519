//! Codelets: the per-architecture implementation bundle a task references
//! (GLOSSARY "Codelet").

use std::fmt;
use std::sync::Arc;

/// The architecture family a worker belongs to (spec.md §3.4, §6 config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Cpu,
    Cuda,
    OpenCl,
    Mic,
    Scc,
    MpiSlave,
}

/// A view over one buffer's backing storage as seen by a running kernel.
///
/// Concrete device transfer primitives (pinned host memory, device
/// pointers, ...) are out of scope (spec.md §1) — this is the seam a
/// [`crate::config::Config`]'s driver layer would widen into real memory
/// views.
pub struct BufferView<'a> {
    pub data: &'a [u8],
}

pub struct BufferViewMut<'a> {
    pub data: &'a mut [u8],
}

/// The function signature a codelet implementation must have. Only `Cpu`
/// implementations are actually invoked by this crate's worker loop — the
/// other architectures are represented so the admission and dispatch path
/// can reason about "does some available worker implement this codelet",
/// per spec.md §7 `NoDevice`, without this crate owning real device
/// execution.
pub type KernelFn = Arc<dyn Fn(&[u8], &[u8]) -> Vec<u8> + Send + Sync>;

/// A function bundle declaring per-architecture implementations and the
/// expected buffer count (GLOSSARY "Codelet").
pub struct Codelet {
    pub name: String,
    pub nbuffers: usize,
    implementations: Vec<(Arch, KernelFn)>,
}

impl Codelet {
    #[must_use]
    pub fn new(name: impl Into<String>, nbuffers: usize) -> Self {
        Self {
            name: name.into(),
            nbuffers,
            implementations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_impl(mut self, arch: Arch, f: KernelFn) -> Self {
        self.implementations.push((arch, f));
        self
    }

    #[must_use]
    pub fn implementation_for(&self, arch: Arch) -> Option<KernelFn> {
        self.implementations
            .iter()
            .find(|(a, _)| *a == arch)
            .map(|(_, f)| Arc::clone(f))
    }

    #[must_use]
    pub fn architectures(&self) -> Vec<Arch> {
        self.implementations.iter().map(|(a, _)| *a).collect()
    }
}

impl fmt::Debug for Codelet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codelet")
            .field("name", &self.name)
            .field("nbuffers", &self.nbuffers)
            .field("architectures", &self.architectures())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_matching_architecture() {
        let cl = Codelet::new("axpy", 2).with_impl(Arch::Cpu, Arc::new(|_, _| Vec::new()));
        assert!(cl.implementation_for(Arch::Cpu).is_some());
        assert!(cl.implementation_for(Arch::Cuda).is_none());
    }
}
