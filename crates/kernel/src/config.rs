use std::time::Duration;

use memory::PoolSizes;
use serde::Deserialize;

use crate::resource_limit::ResourceLimitValues;

/// Kernel tunables. Every field has a default, so a partial JSON object is
/// a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Emulated cores, one host worker thread each.
    pub num_cores: usize,
    /// Round-robin time slice among equal-priority threads.
    pub quantum_us: u64,
    pub pool_sizes: PoolSizes,
    /// Limits given to processes created without their own.
    pub resource_limits: ResourceLimitValues,
    pub handle_table_size: usize,
    /// Seeds address-space layout randomization; 0 picks a fixed default.
    pub aslr_seed: u64,
    pub main_stack_size: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cores: 4,
            quantum_us: 10_000,
            pool_sizes: PoolSizes::default(),
            resource_limits: ResourceLimitValues::default(),
            handle_table_size: 1024,
            aslr_seed: 0,
            main_stack_size: 0x10_0000,
        }
    }
}

impl KernelConfig {
    pub fn quantum(&self) -> Duration {
        Duration::from_micros(self.quantum_us)
    }
}
