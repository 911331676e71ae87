// # Offline LRU-with-Prefetch Strategy
//
// Trace-driven like LFD, but instead of optimal replacement it keeps a
// sliding window over the upcoming acquires and pulls predicted external
// blocks into buffers ahead of time. Prefetch reads run asynchronously; an
// acquire of an in-flight block awaits the read instead of re-issuing it.
//
// Buffers for prefetches are funded from the free list or by speculatively
// evicting least-recently-released blocks that are outside the window and
// need no writeback. Demand eviction (on acquire) uses plain
// least-recently-released order among blocks that are neither pinned nor
// prefetch targets.

use crate::error::{fatal, Result};
use crate::scheduler::block::SwappableBlockId;
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::pool::{BlockValue, InternalBlock};
use crate::scheduler::strategy::SchedulingPolicy;
use crate::scheduler::trace::{PredictionOp, PredictionSequence, TraceCursor};
use crate::storage::{ExternalHandle, IoRequest};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct OfflineLruPrefetchStrategy {
    cursor: TraceCursor,
    /// Least-recently-released order, lazily invalidated via stamps.
    lru: VecDeque<(SwappableBlockId, u64)>,
    /// Prefetch reads still in flight, keyed by target block.
    in_flight: HashMap<SwappableBlockId, IoRequest>,
    /// Number of upcoming acquires considered for prefetching.
    window: usize,
}

impl OfflineLruPrefetchStrategy {
    pub fn new(sequence: PredictionSequence) -> Self {
        Self {
            cursor: TraceCursor::new(Arc::new(sequence)),
            lru: VecDeque::new(),
            in_flight: HashMap::new(),
            window: 1,
        }
    }

    /// Ids of the next `window` recorded acquires, in trace order.
    fn window_targets(&self) -> Vec<SwappableBlockId> {
        let seq = self.cursor.sequence();
        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        let mut pos = self.cursor.position();
        while targets.len() < self.window {
            match seq.get(pos) {
                Some(entry) => {
                    if entry.op.is_acquire() && seen.insert(entry.id) {
                        targets.push(entry.id);
                    }
                    pos += 1;
                }
                None => break,
            }
        }
        targets
    }

    fn note_evictable<V: BlockValue>(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId) {
        let stamp = core.next_release_stamp();
        core.block_mut(id).last_release = stamp;
        self.lru.push_back((id, stamp));
    }

    /// Pop the least recently released block that may be evicted right now.
    /// Prefetch targets are never victims; `exclude` and `clean_only`
    /// additionally restrict speculative eviction on behalf of prefetching.
    fn pop_victim<V: BlockValue>(
        &mut self,
        core: &SchedulerCore<V>,
        exclude: &HashSet<SwappableBlockId>,
        clean_only: bool,
    ) -> Option<SwappableBlockId> {
        let mut idx = 0;
        while idx < self.lru.len() {
            let (id, stamp) = self.lru[idx];
            let stale = !core.is_live(id) || {
                let block = core.block(id);
                !block.is_evictable() || block.last_release != stamp
            };
            if stale {
                self.lru.remove(idx);
                continue;
            }
            if self.in_flight.contains_key(&id)
                || exclude.contains(&id)
                || (clean_only && core.block(id).needs_writeback())
            {
                idx += 1;
                continue;
            }
            self.lru.remove(idx);
            return Some(id);
        }
        None
    }

    /// Issue asynchronous reads for predicted external blocks while buffers
    /// can be funded without I/O.
    fn schedule_prefetches<V: BlockValue>(&mut self, core: &mut SchedulerCore<V>) {
        let targets = self.window_targets();
        let window_set: HashSet<SwappableBlockId> = targets.iter().copied().collect();

        for id in targets {
            if self.in_flight.contains_key(&id) || !core.is_live(id) {
                continue;
            }
            {
                let block = core.block(id);
                if block.is_bound() || !block.external.is_some_and(|h| h.is_valid()) {
                    continue;
                }
            }

            let buffer = match core.pool.allocate() {
                Some(buffer) => buffer,
                None => {
                    let Some(victim) = self.pop_victim(core, &window_set, true) else {
                        break;
                    };
                    if let Err(e) = core.evict(victim) {
                        warn!(block = victim, error = %e, "speculative eviction failed");
                        break;
                    }
                    match core.pool.allocate() {
                        Some(buffer) => buffer,
                        None => break,
                    }
                }
            };

            let handle = core.block(id).external.expect("checked above");
            let request = core.bm.read(buffer.clone(), handle);
            let block = core.block_mut(id);
            block.internal = Some(buffer);
            block.dirty = false;
            self.in_flight.insert(id, request);
            debug!(block = id, "prefetch issued");
        }
    }

    /// Pick a prefetch to cancel when a demand miss needs its buffer: the
    /// in-flight target whose acquire lies farthest ahead.
    fn take_cancellable_prefetch(&mut self) -> Option<(SwappableBlockId, IoRequest)> {
        let targets = self.window_targets();
        let id = targets
            .into_iter()
            .rev()
            .find(|id| self.in_flight.contains_key(id))
            .or_else(|| self.in_flight.keys().next().copied())?;
        let request = self.in_flight.remove(&id)?;
        Some((id, request))
    }

    fn obtain_buffer<V: BlockValue>(
        &mut self,
        core: &mut SchedulerCore<V>,
    ) -> Result<Arc<InternalBlock<V>>> {
        if let Some(buffer) = core.pool.allocate() {
            return Ok(buffer);
        }
        if let Some(victim) = self.pop_victim(core, &HashSet::new(), false) {
            core.evict(victim)?;
        } else if let Some((id, request)) = self.take_cancellable_prefetch() {
            // Prefetch reservations yield to demand misses. The cancelled
            // block stays External either way.
            debug!(block = id, "cancelling prefetch to serve a demand miss");
            match request.wait() {
                Ok(()) => core.evict(id)?,
                Err(e) => {
                    warn!(block = id, error = %e, "cancelled prefetch had failed");
                    core.unbind(id);
                }
            }
        } else {
            fatal!(
                "memory budget overcommitted: all {} buffers are pinned",
                core.pool.capacity()
            );
        }
        Ok(core
            .pool
            .allocate()
            .unwrap_or_else(|| fatal!("pool still empty after making room")))
    }

    /// Await an in-flight prefetch of `id`, if any. On failure the block is
    /// unbound again and the error surfaces to the caller.
    fn await_prefetch<V: BlockValue>(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<bool> {
        match self.in_flight.remove(&id) {
            Some(request) => {
                if let Err(e) = request.wait() {
                    core.unbind(id);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<V: BlockValue> SchedulingPolicy<V> for OfflineLruPrefetchStrategy {
    fn name(&self) -> &'static str {
        "offline-lru-prefetch"
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

        if self.await_prefetch(core, id)? {
            debug!(block = id, "acquire satisfied by prefetch");
            core.block_mut(id).acquire_count += 1;
        } else if core.block(id).is_bound() {
            core.block_mut(id).acquire_count += 1;
        } else {
            let buffer = self.obtain_buffer(core)?;
            core.bind(id, buffer)?;
            core.block_mut(id).acquire_count = 1;
        }

        self.schedule_prefetches(core);
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
        if block.acquire_count == 0 {
            self.note_evictable(core, id);
        }
        self.schedule_prefetches(core);
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
        self.schedule_prefetches(core);
    }

    fn deinitialize(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId) {
        core.expect_live(id);
        if core.block(id).is_acquired() {
            fatal!("deinitialize of acquired block {}", id);
        }
        self.cursor.expect(id, PredictionOp::Deinitialize);
        // A dangling prefetch must finish before its buffer is recycled.
        if let Some(request) = self.in_flight.remove(&id) {
            if let Err(e) = request.wait() {
                warn!(block = id, error = %e, "prefetch failed for deinitialized block");
            }
        }
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
        self.await_prefetch(core, id)?;
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

    fn on_install(&mut self, core: &mut SchedulerCore<V>) {
        if self.cursor.sequence().is_empty() {
            fatal!("offline LRU-prefetch strategy activated without a prediction sequence");
        }
        self.window = core.pool.capacity().max(1);

        self.lru.clear();
        let mut evictable: Vec<(u64, SwappableBlockId)> = core
            .live_ids()
            .filter(|&id| core.block(id).is_evictable())
            .map(|id| (core.block(id).last_release, id))
            .collect();
        evictable.sort_unstable();
        for (stamp, id) in evictable {
            self.lru.push_back((id, stamp));
        }

        self.schedule_prefetches(core);
    }

    fn drain(&mut self, core: &mut SchedulerCore<V>) -> Result<()> {
        let mut first_error = None;
        for (id, request) in self.in_flight.drain() {
            if let Err(e) = request.wait() {
                core.unbind(id);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::pool::BlockPool;
    use crate::storage::{BlockManager, Placement};
    use tempfile::tempdir;

    fn test_core(capacity: usize) -> (SchedulerCore<u64>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bm = Arc::new(
            BlockManager::open::<u64>(dir.path().to_str().unwrap(), 2, 16).unwrap(),
        );
        let pool = BlockPool::new(capacity, 16);
        (SchedulerCore::new(pool, bm, Placement::Striped), dir)
    }

    /// Write a recognizable pattern through an externally stored block.
    fn seeded_external(
        core: &mut SchedulerCore<u64>,
        id: SwappableBlockId,
        fill: u64,
    ) {
        let buffer = core.pool.allocate().unwrap();
        core.bind(id, buffer).unwrap();
        {
            let block = core.block(id);
            block.internal.as_ref().unwrap().write().fill(fill);
        }
        core.block_mut(id).dirty = true;
        core.evict(id).unwrap();
    }

    #[test]
    fn prefetches_upcoming_external_blocks() {
        let (mut core, _dir) = test_core(2);
        let a = core.allocate_id();
        let b = core.allocate_id();
        seeded_external(&mut core, a, 7);
        seeded_external(&mut core, b, 9);

        let mut seq = PredictionSequence::new();
        seq.push(a, PredictionOp::Acquire, 0);
        seq.push(a, PredictionOp::Release, 1);
        seq.push(b, PredictionOp::Acquire, 1);
        seq.push(b, PredictionOp::Release, 2);

        let mut strategy = OfflineLruPrefetchStrategy::new(seq);
        strategy.on_install(&mut core);
        // Both upcoming blocks fit in the pool, so both reads are in flight.
        assert_eq!(strategy.in_flight.len(), 2);

        let ib = strategy.acquire(&mut core, a).unwrap();
        assert!(ib.read().iter().all(|&v| v == 7));
        strategy.release(&mut core, a, false);

        let ib = strategy.acquire(&mut core, b).unwrap();
        assert!(ib.read().iter().all(|&v| v == 9));
        strategy.release(&mut core, b, false);

        // Two seeding reads never happened; only the prefetches read.
        assert_eq!(core.bm.stats().reads, 2);
    }

    #[test]
    fn acquire_awaits_instead_of_rereading() {
        let (mut core, _dir) = test_core(1);
        let a = core.allocate_id();
        seeded_external(&mut core, a, 3);

        let mut seq = PredictionSequence::new();
        seq.push(a, PredictionOp::Acquire, 0);
        seq.push(a, PredictionOp::Release, 1);

        let mut strategy = OfflineLruPrefetchStrategy::new(seq);
        strategy.on_install(&mut core);
        assert!(strategy.in_flight.contains_key(&a));

        strategy.acquire(&mut core, a).unwrap();
        assert!(strategy.in_flight.is_empty());
        assert_eq!(core.bm.stats().reads, 1);
        strategy.release(&mut core, a, false);
    }

    #[test]
    #[should_panic(expected = "without a prediction sequence")]
    fn empty_trace_is_rejected() {
        let (mut core, _dir) = test_core(1);
        let mut strategy = OfflineLruPrefetchStrategy::new(PredictionSequence::new());
        strategy.on_install(&mut core);
    }

    #[test]
    fn drain_completes_in_flight_reads() {
        let (mut core, _dir) = test_core(1);
        let a = core.allocate_id();
        seeded_external(&mut core, a, 5);

        let mut seq = PredictionSequence::new();
        seq.push(a, PredictionOp::Acquire, 0);

        let mut strategy = OfflineLruPrefetchStrategy::new(seq);
        strategy.on_install(&mut core);
        assert!(strategy.in_flight.contains_key(&a));

        strategy.drain(&mut core).unwrap();
        assert!(strategy.in_flight.is_empty());
        let block = core.block(a);
        assert!(block.is_bound());
        assert!(block.internal.as_ref().unwrap().read().iter().all(|&v| v == 5));
    }
}
