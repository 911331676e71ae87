// # Scheduler Core - Shared State and Paging Primitives
//
// Owns the block table, the buffer pool, and the handle to the external block
// manager. Strategies drive policy; the mechanics of binding, writeback, and
// eviction live here so every strategy moves blocks through the same state
// machine.

use crate::error::{fatal, Result};
use crate::scheduler::block::{SwappableBlock, SwappableBlockId};
use crate::scheduler::pool::{BlockPool, BlockValue, InternalBlock};
use crate::storage::{BlockManager, Placement};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) struct SchedulerCore<V: BlockValue> {
    blocks: Vec<SwappableBlock<V>>,
    free_ids: BinaryHeap<Reverse<SwappableBlockId>>,
    pub(crate) pool: BlockPool<V>,
    pub(crate) bm: Arc<BlockManager>,
    pub(crate) placement: Placement,
    pub(crate) time: u64,
    release_seq: u64,
}

impl<V: BlockValue> SchedulerCore<V> {
    pub(crate) fn new(pool: BlockPool<V>, bm: Arc<BlockManager>, placement: Placement) -> Self {
        Self {
            blocks: Vec::new(),
            free_ids: BinaryHeap::new(),
            pool,
            bm,
            placement,
            time: 0,
            release_seq: 0,
        }
    }

    // ------------------------------------------------------------------
    // Id management
    // ------------------------------------------------------------------

    pub(crate) fn allocate_id(&mut self) -> SwappableBlockId {
        if let Some(Reverse(id)) = self.free_ids.pop() {
            self.blocks[id] = SwappableBlock::new();
            id
        } else {
            self.blocks.push(SwappableBlock::new());
            self.blocks.len() - 1
        }
    }

    pub(crate) fn free_id(&mut self, id: SwappableBlockId) {
        self.blocks[id].freed = true;
        self.free_ids.push(Reverse(id));
    }

    pub(crate) fn is_live(&self, id: SwappableBlockId) -> bool {
        id < self.blocks.len() && !self.blocks[id].freed
    }

    pub(crate) fn expect_live(&self, id: SwappableBlockId) {
        if !self.is_live(id) {
            fatal!("operation on invalid or freed swappable block {}", id);
        }
    }

    pub(crate) fn block(&self, id: SwappableBlockId) -> &SwappableBlock<V> {
        self.expect_live(id);
        &self.blocks[id]
    }

    pub(crate) fn block_mut(&mut self, id: SwappableBlockId) -> &mut SwappableBlock<V> {
        self.expect_live(id);
        &mut self.blocks[id]
    }

    /// Live block ids in ascending order.
    pub(crate) fn live_ids(&self) -> impl Iterator<Item = SwappableBlockId> + '_ {
        (0..self.blocks.len()).filter(|&id| !self.blocks[id].freed)
    }

    // ------------------------------------------------------------------
    // Clocks and stamps
    // ------------------------------------------------------------------

    /// Logical time advances on `acquire` and `explicit_timestep`.
    pub(crate) fn advance_time(&mut self) {
        self.time += 1;
    }

    pub(crate) fn next_release_stamp(&mut self) -> u64 {
        self.release_seq += 1;
        self.release_seq
    }

    // ------------------------------------------------------------------
    // Paging mechanics
    // ------------------------------------------------------------------

    /// Make sure the block owns a usable external handle, allocating one from
    /// the block manager if necessary.
    pub(crate) fn ensure_external(&mut self, id: SwappableBlockId) -> Result<()> {
        let needs_alloc = !self.blocks[id]
            .external
            .is_some_and(|handle| handle.is_valid());
        if needs_alloc {
            let handle = self.bm.new_block(self.placement)?;
            self.blocks[id].external = Some(handle);
        }
        Ok(())
    }

    /// Write the bound buffer out to the block's external handle and mark the
    /// external copy current. The binding is left in place.
    pub(crate) fn writeback(&mut self, id: SwappableBlockId) -> Result<()> {
        self.ensure_external(id)?;
        let block = &self.blocks[id];
        let buffer = block
            .internal
            .clone()
            .unwrap_or_else(|| fatal!("writeback of unbound block {}", id));
        let handle = block.external.expect("external ensured above");

        trace!(block = id, "writeback");
        self.bm.write(buffer, handle).wait()?;
        self.blocks[id].dirty = false;
        Ok(())
    }

    /// Detach the buffer lease and hand it back to the pool.
    pub(crate) fn unbind(&mut self, id: SwappableBlockId) {
        if let Some(buffer) = self.blocks[id].detach_internal() {
            self.pool.release(buffer);
        }
    }

    /// Evict a block: write it back if the buffer holds the only current
    /// copy, then return the buffer to the pool.
    ///
    /// On writeback failure the block ends up unbound with its dirty bit
    /// preserved, and the error propagates to the operation that forced the
    /// eviction.
    pub(crate) fn evict(&mut self, id: SwappableBlockId) -> Result<()> {
        debug_assert!(self.blocks[id].is_evictable());
        if self.blocks[id].needs_writeback() {
            debug!(block = id, "evicting with writeback");
            if let Err(e) = self.writeback(id) {
                self.unbind(id);
                return Err(e);
            }
        } else {
            debug!(block = id, "evicting clean block");
        }
        self.unbind(id);
        Ok(())
    }

    /// Bind `buffer` to the block and populate it: read from the external
    /// handle when one is usable, otherwise start from default contents.
    ///
    /// On read failure the buffer goes back to the pool and the block stays
    /// in the External state.
    pub(crate) fn bind(
        &mut self,
        id: SwappableBlockId,
        buffer: Arc<InternalBlock<V>>,
    ) -> Result<()> {
        let readable = self.blocks[id]
            .external
            .is_some_and(|handle| handle.is_valid());
        if readable {
            let handle = self.blocks[id].external.expect("checked above");
            trace!(block = id, "populating buffer from external block");
            if let Err(e) = self.bm.read(buffer.clone(), handle).wait() {
                self.pool.release(buffer);
                return Err(e);
            }
        } else {
            buffer.reset();
        }
        let block = &mut self.blocks[id];
        block.internal = Some(buffer);
        block.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_core(capacity: usize) -> (SchedulerCore<u64>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bm = Arc::new(
            BlockManager::open::<u64>(dir.path().to_str().unwrap(), 2, 32).unwrap(),
        );
        let pool = BlockPool::new(capacity, 32);
        (SchedulerCore::new(pool, bm, Placement::Striped), dir)
    }

    #[test]
    fn freed_ids_are_reused_lowest_first() {
        let (mut core, _dir) = test_core(1);
        let a = core.allocate_id();
        let b = core.allocate_id();
        let c = core.allocate_id();
        assert_eq!((a, b, c), (0, 1, 2));

        core.free_id(c);
        core.free_id(a);
        assert_eq!(core.allocate_id(), 0);
        assert_eq!(core.allocate_id(), 2);
    }

    #[test]
    #[should_panic(expected = "invalid or freed")]
    fn freed_id_access_is_fatal() {
        let (mut core, _dir) = test_core(1);
        let id = core.allocate_id();
        core.free_id(id);
        core.block(id);
    }

    #[test]
    fn evict_writes_back_only_when_needed() {
        let (mut core, _dir) = test_core(2);
        let id = core.allocate_id();

        // Fresh bind, no external copy: eviction must write.
        let buffer = core.pool.allocate().unwrap();
        core.bind(id, buffer).unwrap();
        core.evict(id).unwrap();
        assert_eq!(core.bm.stats().writes, 1);

        // Re-bind from external, keep clean: eviction is I/O-free.
        let buffer = core.pool.allocate().unwrap();
        core.bind(id, buffer).unwrap();
        core.evict(id).unwrap();
        let stats = core.bm.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
    }

    #[test]
    fn bind_round_trips_contents() {
        let (mut core, _dir) = test_core(2);
        let id = core.allocate_id();

        let buffer = core.pool.allocate().unwrap();
        core.bind(id, buffer).unwrap();
        {
            let block = core.block(id);
            let buf = block.internal.as_ref().unwrap();
            for (i, v) in buf.write().iter_mut().enumerate() {
                *v = i as u64;
            }
        }
        core.block_mut(id).dirty = true;
        core.evict(id).unwrap();

        let buffer = core.pool.allocate().unwrap();
        core.bind(id, buffer).unwrap();
        let block = core.block(id);
        let buf = block.internal.as_ref().unwrap();
        assert!(buf.read().iter().enumerate().all(|(i, &v)| v == i as u64));
    }
}
