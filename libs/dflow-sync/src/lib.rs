//! Rendezvous primitives used by dflow's worker lifecycle.

mod barrier;
mod ref_gate;

pub use barrier::{Barrier, BarrierWaitResult};
pub use ref_gate::{RefGate, RefGateState};
