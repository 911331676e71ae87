// # Swappable Block - Logical Block State Machine
//
// A swappable block is either uninitialized, resident in an internal buffer,
// or evicted to an external block. It owns at most one external handle and at
// most one buffer lease at any time.

use crate::scheduler::pool::{BlockValue, InternalBlock};
use crate::storage::ExternalHandle;
use std::sync::Arc;

/// Stable, scheduler-scoped block identifier. Freed ids are reused,
/// lowest first.
pub type SwappableBlockId = usize;

pub(crate) struct SwappableBlock<V> {
    pub(crate) internal: Option<Arc<InternalBlock<V>>>,
    pub(crate) external: Option<ExternalHandle>,
    pub(crate) dirty: bool,
    pub(crate) acquire_count: u32,
    /// Stamp of the release that last made this block evictable.
    pub(crate) last_release: u64,
    /// Set between `free_swappable_block` and id reuse.
    pub(crate) freed: bool,
}

impl<V: BlockValue> SwappableBlock<V> {
    pub(crate) fn new() -> Self {
        Self {
            internal: None,
            external: None,
            dirty: false,
            acquire_count: 0,
            last_release: 0,
            freed: false,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.internal.is_some() || self.external.is_some()
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.internal.is_some()
    }

    pub(crate) fn is_acquired(&self) -> bool {
        self.acquire_count > 0
    }

    /// Bound, unpinned, and therefore a candidate for eviction.
    pub(crate) fn is_evictable(&self) -> bool {
        self.is_bound() && !self.is_acquired()
    }

    /// True when the external copy is present and current.
    pub(crate) fn externally_current(&self) -> bool {
        !self.dirty && self.external.is_some_and(|e| e.is_valid())
    }

    /// Eviction of this block must write the buffer out first: either the
    /// client dirtied it, or the buffer holds the only copy of the contents.
    pub(crate) fn needs_writeback(&self) -> bool {
        self.is_bound() && !self.externally_current()
    }

    /// Hand the buffer lease back. Caller returns it to the pool.
    pub(crate) fn detach_internal(&mut self) -> Option<Arc<InternalBlock<V>>> {
        self.internal.take()
    }
}
