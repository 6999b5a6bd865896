//! Session configuration.
//!
//! ## Environment Variables
//!
//! - `HLE_KERNEL_CORES`: number of virtual cores (1..=64, default 4)
//! - `HLE_KERNEL_TIME_SLICE_US`: round-robin quantum in microseconds (default 10000)
//!
//! How long a guest-perceived time slice should be is an emulation-fidelity
//! choice, so it is configuration rather than a constant.
use std::{env, time::Duration};
use tracing::warn;

use super::types::CoreId;

pub const DEFAULT_CORE_COUNT: usize = 4;
pub const MAX_CORE_COUNT: usize = 64;
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of virtual cores the guest believes it has
    pub core_count: usize,
    /// Quantum after which a running thread rotates behind equal-priority peers
    pub time_slice: Duration,
    /// Core that threads created with "use process default" land on
    pub default_core: CoreId,
    pub max_threads_per_process: usize,
    pub max_handles_per_process: usize,
    /// Maximum number of objects in a single WaitSynchronization
    pub max_wait_objects: usize,
    /// Maximum length of a priority-inheritance chain that is followed
    pub inheritance_depth_limit: usize,
    /// How long process teardown waits for running threads before warning
    pub stall_warning: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            core_count: DEFAULT_CORE_COUNT,
            time_slice: DEFAULT_TIME_SLICE,
            default_core: CoreId(0),
            max_threads_per_process: 256,
            max_handles_per_process: 1024,
            max_wait_objects: 64,
            inheritance_depth_limit: 16,
            stall_warning: Duration::from_secs(1),
        }
    }
}

impl KernelConfig {
    /// Defaults overlaid with any `HLE_KERNEL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(cores) = read_var::<usize>("HLE_KERNEL_CORES") {
            config = config.with_core_count(cores);
        }

        if let Some(us) = read_var::<u64>("HLE_KERNEL_TIME_SLICE_US") {
            config.time_slice = Duration::from_micros(us.max(1));
        }

        config
    }

    pub fn with_core_count(mut self, cores: usize) -> Self {
        self.core_count = cores.clamp(1, MAX_CORE_COUNT);
        if self.default_core.index() >= self.core_count {
            self.default_core = CoreId(0);
        }
        self
    }

    pub fn with_time_slice(mut self, time_slice: Duration) -> Self {
        self.time_slice = time_slice.max(Duration::from_micros(1));
        self
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_count_is_clamped() {
        assert_eq!(KernelConfig::default().with_core_count(0).core_count, 1);
        assert_eq!(
            KernelConfig::default().with_core_count(1000).core_count,
            MAX_CORE_COUNT
        );
        assert_eq!(KernelConfig::default().with_core_count(2).core_count, 2);
    }

    #[test]
    fn test_time_slice_never_zero() {
        let config = KernelConfig::default().with_time_slice(Duration::ZERO);
        assert!(config.time_slice > Duration::ZERO);
    }
}
