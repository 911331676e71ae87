// # Simulation Strategy - Trace Recorder
//
// Performs no I/O and binds no buffers. Block lifecycles are tracked in
// phantom per-block states; every operation appends a prediction entry at the
// current logical time. `acquire` hands out a sentinel buffer that callers
// must not read (they check `is_simulating()` first).

use crate::error::{fatal, Result};
use crate::scheduler::block::SwappableBlockId;
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::pool::{BlockValue, InternalBlock};
use crate::scheduler::strategy::SchedulingPolicy;
use crate::scheduler::trace::{PredictionOp, PredictionSequence};
use crate::storage::ExternalHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, Default)]
struct SimBlockState {
    initialized: bool,
    acquired: u32,
}

pub struct SimulationStrategy<V> {
    sequence: PredictionSequence,
    states: HashMap<SwappableBlockId, SimBlockState>,
    sentinel: Option<Arc<InternalBlock<V>>>,
}

impl<V: BlockValue> SimulationStrategy<V> {
    pub fn new() -> Self {
        Self {
            sequence: PredictionSequence::new(),
            states: HashMap::new(),
            sentinel: None,
        }
    }

    fn state(&mut self, id: SwappableBlockId) -> &mut SimBlockState {
        self.states.entry(id).or_default()
    }

    fn record(&mut self, id: SwappableBlockId, op: PredictionOp, time: u64) {
        trace!(block = id, %op, time, "recording prediction entry");
        self.sequence.push(id, op, time);
    }
}

impl<V: BlockValue> Default for SimulationStrategy<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: BlockValue> SchedulingPolicy<V> for SimulationStrategy<V> {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn acquire(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<Arc<InternalBlock<V>>> {
        core.expect_live(id);
        let time = core.time;
        let state = self.state(id);
        let op = if state.initialized {
            PredictionOp::Acquire
        } else {
            PredictionOp::AcquireDirty
        };
        state.initialized = true;
        state.acquired += 1;
        self.record(id, op, time);
        core.advance_time();

        let sentinel = self
            .sentinel
            .get_or_insert_with(|| Arc::new(InternalBlock::new(core.pool.block_size())));
        Ok(sentinel.clone())
    }

    fn release(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId, dirty: bool) {
        core.expect_live(id);
        let time = core.time;
        let state = self.state(id);
        if state.acquired == 0 {
            fatal!("release of block {} without a matching acquire", id);
        }
        state.acquired -= 1;
        let op = if dirty {
            PredictionOp::ReleaseDirty
        } else {
            PredictionOp::Release
        };
        self.record(id, op, time);
    }

    fn initialize(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
        _external: ExternalHandle,
    ) {
        core.expect_live(id);
        let time = core.time;
        let state = self.state(id);
        if state.initialized {
            fatal!("initialize of already initialized block {}", id);
        }
        state.initialized = true;
        self.record(id, PredictionOp::Initialize, time);
    }

    fn deinitialize(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId) {
        core.expect_live(id);
        let time = core.time;
        let state = self.state(id);
        if state.acquired > 0 {
            fatal!("deinitialize of acquired block {}", id);
        }
        state.initialized = false;
        self.record(id, PredictionOp::Deinitialize, time);
    }

    fn extract_external_block(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<ExternalHandle> {
        core.expect_live(id);
        let time = core.time;
        let state = self.state(id);
        if state.acquired > 0 {
            fatal!("extract_external_block of acquired block {}", id);
        }
        if !state.initialized {
            fatal!("extract_external_block of uninitialized block {}", id);
        }
        state.initialized = false;
        self.record(id, PredictionOp::Extract, time);
        Ok(ExternalHandle::default())
    }

    fn on_install(&mut self, core: &mut SchedulerCore<V>) {
        // Phantom states start from the real resident set.
        self.states = core
            .live_ids()
            .map(|id| {
                let block = core.block(id);
                (
                    id,
                    SimBlockState {
                        initialized: block.is_initialized(),
                        acquired: block.acquire_count,
                    },
                )
            })
            .collect();
    }

    fn on_allocate(&mut self, id: SwappableBlockId) {
        self.states.insert(id, SimBlockState::default());
    }

    fn on_free(&mut self, id: SwappableBlockId) {
        self.states.remove(&id);
    }

    fn is_simulating(&self) -> bool {
        true
    }

    fn is_initialized(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> bool {
        core.expect_live(id);
        self.states.get(&id).is_some_and(|s| s.initialized)
    }

    fn acquire_count(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> u32 {
        core.expect_live(id);
        self.states.get(&id).map_or(0, |s| s.acquired)
    }

    fn get_internal_block(
        &self,
        core: &SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Arc<InternalBlock<V>> {
        core.expect_live(id);
        if self.states.get(&id).map_or(0, |s| s.acquired) == 0 {
            fatal!("get_internal_block of block {} with no holders", id);
        }
        self.sentinel
            .clone()
            .unwrap_or_else(|| fatal!("no sentinel buffer while simulating"))
    }

    fn prediction_sequence(&self) -> Option<PredictionSequence> {
        Some(self.sequence.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::pool::BlockPool;
    use crate::storage::{BlockManager, Placement};
    use tempfile::tempdir;

    fn test_setup() -> (SchedulerCore<u64>, SimulationStrategy<u64>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bm = Arc::new(
            BlockManager::open::<u64>(dir.path().to_str().unwrap(), 1, 16).unwrap(),
        );
        let pool = BlockPool::new(1, 16);
        (
            SchedulerCore::new(pool, bm, Placement::Striped),
            SimulationStrategy::new(),
            dir,
        )
    }

    #[test]
    fn records_ops_with_monotonic_time() {
        let (mut core, mut sim, _dir) = test_setup();
        let id = core.allocate_id();
        sim.on_allocate(id);

        sim.acquire(&mut core, id).unwrap();
        sim.acquire(&mut core, id).unwrap();
        sim.release(&mut core, id, true);
        sim.explicit_timestep(&mut core);
        sim.release(&mut core, id, false);
        sim.deinitialize(&mut core, id);
        sim.initialize(&mut core, id, ExternalHandle::default());
        sim.extract_external_block(&mut core, id).unwrap();

        let seq = sim.prediction_sequence().unwrap();
        let ops: Vec<PredictionOp> = seq.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![
                PredictionOp::AcquireDirty,
                PredictionOp::Acquire,
                PredictionOp::ReleaseDirty,
                PredictionOp::Release,
                PredictionOp::Deinitialize,
                PredictionOp::Initialize,
                PredictionOp::Extract,
            ]
        );
        let times: Vec<u64> = seq.iter().map(|e| e.time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        // The explicit timestep separates the two releases.
        assert!(times[3] > times[2]);
    }

    #[test]
    fn no_io_and_no_buffers_bound() {
        let (mut core, mut sim, _dir) = test_setup();
        let id = core.allocate_id();
        sim.on_allocate(id);

        sim.acquire(&mut core, id).unwrap();
        sim.release(&mut core, id, true);

        assert!(!core.block(id).is_bound());
        assert_eq!(core.pool.free_count(), core.pool.capacity());
        let stats = core.bm.stats();
        assert_eq!((stats.reads, stats.writes), (0, 0));
    }

    #[test]
    fn phantom_initialization_is_visible() {
        let (mut core, mut sim, _dir) = test_setup();
        let id = core.allocate_id();
        sim.on_allocate(id);

        assert!(!sim.is_initialized(&core, id));
        sim.acquire(&mut core, id).unwrap();
        assert!(sim.is_initialized(&core, id));
        assert!(!core.block(id).is_initialized());
    }

    #[test]
    #[should_panic(expected = "without a matching acquire")]
    fn simulated_over_release_is_fatal() {
        let (mut core, mut sim, _dir) = test_setup();
        let id = core.allocate_id();
        sim.on_allocate(id);
        sim.release(&mut core, id, false);
    }
}
