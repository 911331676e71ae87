// # Scheduling Strategies
//
// The set of paging policies is closed: a reactive online strategy, a trace
// recorder, and two trace-driven offline strategies. Each implements the
// `SchedulingPolicy` trait against the shared scheduler core; `Strategy` is
// the tagged variant the facade owns and that `switch_algorithm_to` moves in
// and out.

pub mod lru_prefetch;
pub mod offline_lfd;
pub mod online;
pub mod simulation;

pub use lru_prefetch::OfflineLruPrefetchStrategy;
pub use offline_lfd::OfflineLfdStrategy;
pub use online::OnlineStrategy;
pub use simulation::SimulationStrategy;

use crate::error::{fatal, Result};
use crate::scheduler::block::SwappableBlockId;
use crate::scheduler::core::SchedulerCore;
use crate::scheduler::pool::{BlockValue, InternalBlock};
use crate::scheduler::trace::PredictionSequence;
use crate::storage::ExternalHandle;
use std::sync::Arc;

pub(crate) trait SchedulingPolicy<V: BlockValue> {
    fn name(&self) -> &'static str;

    fn acquire(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<Arc<InternalBlock<V>>>;

    fn release(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId, dirty: bool);

    fn initialize(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
        external: ExternalHandle,
    );

    fn deinitialize(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId);

    fn extract_external_block(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<ExternalHandle>;

    fn explicit_timestep(&mut self, core: &mut SchedulerCore<V>) {
        core.advance_time();
    }

    /// Called when the strategy is installed; inherits the resident set.
    fn on_install(&mut self, core: &mut SchedulerCore<V>) {
        let _ = core;
    }

    /// Complete all in-flight I/O. Called before the strategy is replaced
    /// and when the scheduler shuts down.
    fn drain(&mut self, core: &mut SchedulerCore<V>) -> Result<()> {
        let _ = core;
        Ok(())
    }

    fn on_allocate(&mut self, id: SwappableBlockId) {
        let _ = id;
    }

    fn on_free(&mut self, id: SwappableBlockId) {
        let _ = id;
    }

    fn is_simulating(&self) -> bool {
        false
    }

    fn is_initialized(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> bool {
        core.block(id).is_initialized()
    }

    fn acquire_count(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> u32 {
        core.block(id).acquire_count
    }

    fn get_internal_block(
        &self,
        core: &SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Arc<InternalBlock<V>> {
        core.block(id)
            .internal
            .clone()
            .unwrap_or_else(|| fatal!("get_internal_block of unbound block {}", id))
    }

    fn prediction_sequence(&self) -> Option<PredictionSequence> {
        None
    }
}

/// The closed set of paging strategies.
pub enum Strategy<V: BlockValue> {
    Online(OnlineStrategy),
    Simulation(SimulationStrategy<V>),
    OfflineLfd(OfflineLfdStrategy),
    OfflineLruPrefetch(OfflineLruPrefetchStrategy),
}

impl<V: BlockValue> Strategy<V> {
    pub fn online() -> Self {
        Strategy::Online(OnlineStrategy::new())
    }

    pub fn simulation() -> Self {
        Strategy::Simulation(SimulationStrategy::new())
    }

    pub fn offline_lfd(sequence: PredictionSequence) -> Self {
        Strategy::OfflineLfd(OfflineLfdStrategy::new(sequence))
    }

    pub fn offline_lru_prefetch(sequence: PredictionSequence) -> Self {
        Strategy::OfflineLruPrefetch(OfflineLruPrefetchStrategy::new(sequence))
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            Strategy::Online(s) => s.$method($($arg),*),
            Strategy::Simulation(s) => s.$method($($arg),*),
            Strategy::OfflineLfd(s) => s.$method($($arg),*),
            Strategy::OfflineLruPrefetch(s) => s.$method($($arg),*),
        }
    };
}

impl<V: BlockValue> SchedulingPolicy<V> for Strategy<V> {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Online(s) => SchedulingPolicy::<V>::name(s),
            Strategy::Simulation(s) => SchedulingPolicy::<V>::name(s),
            Strategy::OfflineLfd(s) => SchedulingPolicy::<V>::name(s),
            Strategy::OfflineLruPrefetch(s) => SchedulingPolicy::<V>::name(s),
        }
    }

    fn acquire(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<Arc<InternalBlock<V>>> {
        delegate!(self, acquire(core, id))
    }

    fn release(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId, dirty: bool) {
        delegate!(self, release(core, id, dirty))
    }

    fn initialize(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
        external: ExternalHandle,
    ) {
        delegate!(self, initialize(core, id, external))
    }

    fn deinitialize(&mut self, core: &mut SchedulerCore<V>, id: SwappableBlockId) {
        delegate!(self, deinitialize(core, id))
    }

    fn extract_external_block(
        &mut self,
        core: &mut SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Result<ExternalHandle> {
        delegate!(self, extract_external_block(core, id))
    }

    fn explicit_timestep(&mut self, core: &mut SchedulerCore<V>) {
        delegate!(self, explicit_timestep(core))
    }

    fn on_install(&mut self, core: &mut SchedulerCore<V>) {
        delegate!(self, on_install(core))
    }

    fn drain(&mut self, core: &mut SchedulerCore<V>) -> Result<()> {
        delegate!(self, drain(core))
    }

    fn on_allocate(&mut self, id: SwappableBlockId) {
        match self {
            Strategy::Online(s) => SchedulingPolicy::<V>::on_allocate(s, id),
            Strategy::Simulation(s) => SchedulingPolicy::<V>::on_allocate(s, id),
            Strategy::OfflineLfd(s) => SchedulingPolicy::<V>::on_allocate(s, id),
            Strategy::OfflineLruPrefetch(s) => SchedulingPolicy::<V>::on_allocate(s, id),
        }
    }

    fn on_free(&mut self, id: SwappableBlockId) {
        match self {
            Strategy::Online(s) => SchedulingPolicy::<V>::on_free(s, id),
            Strategy::Simulation(s) => SchedulingPolicy::<V>::on_free(s, id),
            Strategy::OfflineLfd(s) => SchedulingPolicy::<V>::on_free(s, id),
            Strategy::OfflineLruPrefetch(s) => SchedulingPolicy::<V>::on_free(s, id),
        }
    }

    fn is_simulating(&self) -> bool {
        match self {
            Strategy::Online(s) => SchedulingPolicy::<V>::is_simulating(s),
            Strategy::Simulation(s) => SchedulingPolicy::<V>::is_simulating(s),
            Strategy::OfflineLfd(s) => SchedulingPolicy::<V>::is_simulating(s),
            Strategy::OfflineLruPrefetch(s) => SchedulingPolicy::<V>::is_simulating(s),
        }
    }

    fn is_initialized(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> bool {
        delegate!(self, is_initialized(core, id))
    }

    fn acquire_count(&self, core: &SchedulerCore<V>, id: SwappableBlockId) -> u32 {
        delegate!(self, acquire_count(core, id))
    }

    fn get_internal_block(
        &self,
        core: &SchedulerCore<V>,
        id: SwappableBlockId,
    ) -> Arc<InternalBlock<V>> {
        delegate!(self, get_internal_block(core, id))
    }

    fn prediction_sequence(&self) -> Option<PredictionSequence> {
        match self {
            Strategy::Online(s) => SchedulingPolicy::<V>::prediction_sequence(s),
            Strategy::Simulation(s) => SchedulingPolicy::<V>::prediction_sequence(s),
            Strategy::OfflineLfd(s) => SchedulingPolicy::<V>::prediction_sequence(s),
            Strategy::OfflineLruPrefetch(s) => SchedulingPolicy::<V>::prediction_sequence(s),
        }
    }
}
