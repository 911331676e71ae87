pub mod block;
pub(crate) mod core;
pub mod pool;
pub mod strategy;
pub mod trace;

pub use block::SwappableBlockId;
pub use pool::{BlockValue, InternalBlock};
pub use strategy::Strategy;
pub use trace::{PredictionEntry, PredictionOp, PredictionSequence, TraceCursor};

use crate::error::{fatal, Result, SchedulerError};
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::pool::BlockPool;
use crate::scheduler::strategy::SchedulingPolicy;
use crate::storage::{encoded_block_size, BlockManager, ExternalHandle};
use crate::SchedulerConfig;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Client-facing scheduler: serializes all operations, maintains the block
/// table and buffer pool, and drives the active paging strategy.
///
/// All operations are synchronous from the caller's viewpoint; internal I/O
/// may block. Contract violations are fatal; I/O failures propagate as `Err`.
pub struct BlockScheduler<V: BlockValue> {
    core: SchedulerCore<V>,
    strategy: Strategy<V>,
}

impl<V: BlockValue> BlockScheduler<V> {
    /// Build a scheduler over `bm` with the online strategy active.
    ///
    /// The buffer pool holds `memory_budget / (block_size * sizeof(V))`
    /// buffers; a budget below one block is rejected.
    pub fn new(config: &SchedulerConfig, bm: Arc<BlockManager>) -> Result<Self> {
        let footprint = config.block_size * std::mem::size_of::<V>();
        if footprint == 0 {
            return Err(SchedulerError::Config(
                "block footprint is zero; check block_size and value type".to_string(),
            ));
        }
        let expected = encoded_block_size::<V>(config.block_size);
        if bm.block_bytes() != expected {
            return Err(SchedulerError::Config(format!(
                "block manager slot size is {} bytes, this scheduler needs {}",
                bm.block_bytes(),
                expected
            )));
        }
        let capacity = (config.memory_budget / footprint as u64) as usize;
        if capacity == 0 {
            return Err(SchedulerError::Config(format!(
                "memory budget of {} bytes is below one block ({} bytes)",
                config.memory_budget, footprint
            )));
        }

        info!(
            capacity,
            block_size = config.block_size,
            "block scheduler starting with online strategy"
        );
        let pool = BlockPool::new(capacity, config.block_size);
        Ok(Self {
            core: SchedulerCore::new(pool, bm, config.placement),
            strategy: Strategy::online(),
        })
    }

    /// Number of buffers in the pool.
    pub fn pool_capacity(&self) -> usize {
        self.core.pool.capacity()
    }

    /// Issue a fresh id in the Uninitialized state. O(1); freed ids are
    /// reused lowest-first.
    pub fn allocate_swappable_block(&mut self) -> SwappableBlockId {
        let id = self.core.allocate_id();
        self.strategy.on_allocate(id);
        debug!(block = id, "allocated swappable block");
        id
    }

    /// Release the id slot. The block must be uninitialized with no holders.
    pub fn free_swappable_block(&mut self, id: SwappableBlockId) {
        self.core.expect_live(id);
        if self.strategy.acquire_count(&self.core, id) > 0 {
            fatal!("free_swappable_block of acquired block {}", id);
        }
        if self.strategy.is_initialized(&self.core, id) {
            fatal!("free_swappable_block of initialized block {}", id);
        }
        self.strategy.on_free(id);
        self.core.free_id(id);
        debug!(block = id, "freed swappable block");
    }

    /// Adopt `external` as the block's backing copy. The block must be
    /// uninitialized.
    pub fn initialize(&mut self, id: SwappableBlockId, external: ExternalHandle) {
        self.strategy.initialize(&mut self.core, id, external);
    }

    /// Drop the block's contents and return its external block to the
    /// allocator. The block must have no holders.
    pub fn deinitialize(&mut self, id: SwappableBlockId) {
        self.strategy.deinitialize(&mut self.core, id);
    }

    /// Pin the block into a buffer and return the binding. Valid until the
    /// matching `release`; may evict another block to make room.
    pub fn acquire(&mut self, id: SwappableBlockId) -> Result<Arc<InternalBlock<V>>> {
        self.strategy.acquire(&mut self.core, id)
    }

    /// Drop one hold on the block; `dirty` marks the buffer as modified.
    /// When the last hold goes, the block becomes evictable.
    pub fn release(&mut self, id: SwappableBlockId, dirty: bool) {
        self.strategy.release(&mut self.core, id, dirty);
    }

    /// Re-fetch the binding of a block the caller already holds.
    pub fn get_internal_block(&self, id: SwappableBlockId) -> Arc<InternalBlock<V>> {
        self.core.expect_live(id);
        if self.strategy.acquire_count(&self.core, id) == 0 {
            fatal!("get_internal_block of block {} with no holders", id);
        }
        self.strategy.get_internal_block(&self.core, id)
    }

    pub fn is_initialized(&self, id: SwappableBlockId) -> bool {
        self.strategy.is_initialized(&self.core, id)
    }

    /// Take ownership of the block's external handle; the block becomes
    /// uninitialized. A dirty binding is flushed first.
    pub fn extract_external_block(&mut self, id: SwappableBlockId) -> Result<ExternalHandle> {
        self.strategy.extract_external_block(&mut self.core, id)
    }

    /// Advance logical time without touching any block.
    pub fn explicit_timestep(&mut self) {
        self.strategy.explicit_timestep(&mut self.core);
    }

    pub fn is_simulating(&self) -> bool {
        self.strategy.is_simulating()
    }

    /// The trace recorded so far. Only the simulation strategy records one;
    /// calling this under any other strategy is a programming error.
    pub fn get_prediction_sequence(&self) -> PredictionSequence {
        self.strategy.prediction_sequence().unwrap_or_else(|| {
            fatal!(
                "get_prediction_sequence requires the simulation strategy (active: {})",
                self.strategy.name()
            )
        })
    }

    /// Atomically replace the paging strategy. In-flight I/O of the old
    /// strategy is drained first; the new strategy inherits the resident
    /// set. The replaced strategy is returned for inspection or disposal.
    pub fn switch_algorithm_to(&mut self, mut strategy: Strategy<V>) -> Result<Strategy<V>> {
        self.strategy.drain(&mut self.core)?;
        strategy.on_install(&mut self.core);
        info!(
            from = self.strategy.name(),
            to = strategy.name(),
            "switching scheduling strategy"
        );
        Ok(std::mem::replace(&mut self.strategy, strategy))
    }
}

impl<V: BlockValue> Drop for BlockScheduler<V> {
    /// Tolerant shutdown: clients may leak acquired or initialized blocks
    /// (the harness does, deliberately). Buffers go back to the pool and
    /// external blocks back to the allocator.
    fn drop(&mut self) {
        if let Err(e) = self.strategy.drain(&mut self.core) {
            warn!(error = %e, "draining in-flight I/O during shutdown failed");
        }
        let ids: Vec<SwappableBlockId> = self.core.live_ids().collect();
        for id in ids {
            if self.core.block(id).is_acquired() {
                warn!(
                    block = id,
                    holders = self.core.block(id).acquire_count,
                    "scheduler dropped while block still acquired"
                );
                self.core.block_mut(id).acquire_count = 0;
            }
            self.core.unbind(id);
            let external = self.core.block_mut(id).external.take();
            if let Some(handle) = external {
                if handle.is_valid() {
                    self.core.bm.delete_block(handle);
                }
            }
        }
    }
}
