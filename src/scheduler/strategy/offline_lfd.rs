// # Offline LFD Strategy - Belady Replacement Over a Recorded Trace
//
// Replays a prediction sequence captured by the simulation strategy. Every
// live operation is checked against the trace head; the eviction victim is
// the unpinned bound block whose next recorded acquire lies farthest in the
// future (infinity when it is never acquired again).

use crate::error::{fatal, Result};
use crate::scheduler::block::SwappableBlockId;
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::pool::{BlockValue, InternalBlock};
use crate::scheduler::strategy::SchedulingPolicy;
use crate::scheduler::trace::{PredictionOp, PredictionSequence, TraceCursor};
use crate::storage::ExternalHandle;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

const NEVER: usize = usize::MAX;

pub struct OfflineLfdStrategy {
    cursor: TraceCursor,
    /// Positions of future acquires, per block, in trace order.
    future: HashMap<SwappableBlockId, VecDeque<usize>>,
}

impl OfflineLfdStrategy {
    pub fn new(sequence: PredictionSequence) -> Self {
        let mut future: HashMap<SwappableBlockId, VecDeque<usize>> = HashMap::new();
        for (pos, entry) in sequence.iter().enumerate() {
            if entry.op.is_acquire() {
                future.entry(entry.id).or_default().push_back(pos);
            }
        }
        Self {
            cursor: TraceCursor::new(Arc::new(sequence)),
            future,
        }
    }

    /// Next recorded acquire of `id` at or after the cursor, `NEVER` if none.
    fn next_use(&mut self, id: SwappableBlockId) -> usize {
        let pos = self.cursor.position();
        match self.future.get_mut(&id) {
            Some(positions) => {
                while positions.front().is_some_and(|&p| p < pos) {
                    positions.pop_front();
                }
                positions.front().copied().unwrap_or(NEVER)
            }
            None => NEVER,
        }
    }

    /// Belady: evict the candidate accessed farthest in the future. Lowest id
    /// wins among blocks that are never accessed again.
    fn pop_victim<V: BlockValue>(&mut self, core: &SchedulerCore<V>) -> Option<SwappableBlockId> {
        let candidates: Vec<SwappableBlockId> = core
            .live_ids()
            .filter(|&id| core.block(id).is_evictable())
            .collect();
        let mut best: Option<(usize, SwappableBlockId)> = None;
        for id in candidates {
            let next = self.next_use(id);
            if best.is_none_or(|(best_next, _)| next > best_next) {
                best = Some((next, id));
            }
        }
        best.map(|(next, id)| {
            debug!(block = id, next_use = next, "LFD victim");
            id
        })
    }

    fn obtain_buffer<V: BlockValue>(
        &mut self,
        core: &mut SchedulerCore<V>,
    ) -> Result<Arc<InternalBlock<V>>> {
        if let Some(buffer) = core.pool.allocate() {
            return Ok(buffer);
        }
        let victim = self.pop_victim(core).unwrap_or_else(|| {
            fatal!(
                "memory budget overcommitted: all {} buffers are pinned and no block is evictable",
                core.pool.capacity()
            )
        });
        core.evict(victim)?;
        Ok(core
            .pool
            .allocate()
            .unwrap_or_else(|| fatal!("pool empty after evicting block {}", victim)))
    }
}

impl<V: BlockValue> SchedulingPolicy<V> for OfflineLfdStrategy {
    fn name(&self) -> &'static str {
        "offline-lfd"
    }

    fn acquire(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<Arc<InternalBlock<V>>> {
        core.expect_live(id);
        let op = if core.block(id).is_initialized() {
            PredictionOp::Acquire
        } else {
            PredictionOp::AcquireDirty
        };
        self.cursor.expect(id, op);
        core.advance_time();

        if core.block(id).is_bound() {
            core.block_mut(id).acquire_count += 1;
        } else {
            let buffer = self.obtain_buffer(core)?;
            core.bind(id, buffer)?;
            core.block_mut(id).acquire_count = 1;
        }
        Ok(core
            .block(id)
            .internal
            .clone()
            .expect("acquired block is bound"))
    }

    fn release(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId, dirty: bool) {
        core.expect_live(id);
        if !core.block(id).is_acquired() {
            fatal!("release of block {} without a matching acquire", id);
        }
        let op = if dirty {
            PredictionOp::ReleaseDirty
        } else {
            PredictionOp::Release
        };
        self.cursor.expect(id, op);
        let block = core.block_mut(id);
        block.dirty |= dirty;
        block.acquire_count -= 1;
        let needs_stamp = block.acquire_count == 0;
        if needs_stamp {
            let stamp = core.next_release_stamp();
            core.block_mut(id).last_release = stamp;
        }
    }

    fn initialize(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
        external: ExternalHandle,
    ) {
        core.expect_live(id);
        if core.block(id).is_initialized() {
            fatal!("initialize of already initialized block {}", id);
        }
        self.cursor.expect(id, PredictionOp::Initialize);
        core.block_mut(id).external = Some(external);
    }

    fn deinitialize(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId) {
        core.expect_live(id);
        if core.block(id).is_acquired() {
            fatal!("deinitialize of acquired block {}", id);
        }
        self.cursor.expect(id, PredictionOp::Deinitialize);
        core.unbind(id);
        let block = core.block_mut(id);
        block.dirty = false;
        let external = block.external.take();
        if let Some(handle) = external {
            if handle.is_valid() {
                core.bm.delete_block(handle);
            }
        }
    }

    fn extract_external_block(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<ExternalHandle> {
        core.expect_live(id);
        if core.block(id).is_acquired() {
            fatal!("extract_external_block of acquired block {}", id);
        }
        if !core.block(id).is_initialized() {
            fatal!("extract_external_block of uninitialized block {}", id);
        }
        self.cursor.expect(id, PredictionOp::Extract);
        if core.block(id).is_bound() {
            if core.block(id).needs_writeback() {
                if let Err(e) = core.writeback(id) {
                    core.unbind(id);
                    return Err(e);
                }
            }
            core.unbind(id);
        }
        let block = core.block_mut(id);
        block.dirty = false;
        Ok(block.external.take().unwrap_or_default())
    }
}
