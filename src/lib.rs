// Blockswap - Out-of-core swappable block scheduler
// Core library module

pub mod error;
pub mod scheduler;
pub mod storage;

pub use error::{Result, SchedulerError};
pub use scheduler::{
    BlockScheduler, BlockValue, InternalBlock, PredictionEntry, PredictionOp, PredictionSequence,
    Strategy, SwappableBlockId,
};
pub use storage::{encoded_block_size, BlockManager, ExternalHandle, IoStats, Placement};

use serde::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Directory holding the external block manager's file pool.
    pub data_dir: String,
    /// Number of backing files external blocks are spread across.
    pub num_files: usize,
    /// Elements per block.
    pub block_size: usize,
    /// Total resident memory in bytes; must cover at least one block.
    pub memory_budget: u64,
    /// Placement policy for newly allocated external blocks.
    pub placement: Placement,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            num_files: 4,
            block_size: 1024,
            memory_budget: 256 * 1024 * 1024,
            placement: Placement::Striped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = SchedulerConfig::default();
        assert!(config.num_files >= 1);
        assert!(config.memory_budget >= (config.block_size * 8) as u64);
    }
}
