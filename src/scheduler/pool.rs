// # Internal Block Pool - Bounded Free-List of In-Memory Buffers
//
// The pool owns every internal buffer the scheduler may use. Its capacity is
// fixed at construction (memory budget divided by block footprint) and blocks
// lease buffers from it while they are bound.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Contract for the element type stored in a block.
///
/// Default-constructible (fresh buffers start in the default state), trivially
/// relocatable (`Copy`), and serde-encodable so buffers can round-trip through
/// external storage.
pub trait BlockValue:
    Copy + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> BlockValue for T where
    T: Copy + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A fixed-size in-memory buffer holding one block's worth of elements.
///
/// Buffers are shared via `Arc`: the pool keeps them alive, a bound block
/// leases one, and an in-flight I/O request may hold a second reference. The
/// interior `RwLock` arbitrates between the client and I/O completion.
pub struct InternalBlock<V> {
    size: usize,
    data: RwLock<Vec<V>>,
}

impl<V: BlockValue> InternalBlock<V> {
    /// A standalone buffer of `size` default elements. Pool buffers are
    /// created internally; this is also usable as a staging buffer for
    /// direct block manager I/O.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            data: RwLock::new(vec![V::default(); size]),
        }
    }

    /// Number of elements in the buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<V>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<V>> {
        self.data.write()
    }

    /// Reset every element to the default state. Used when a recycled buffer
    /// is handed to a freshly initialized block.
    pub(crate) fn reset(&self) {
        self.data.write().fill(V::default());
    }

    /// Replace the buffer contents, used by read completion.
    pub(crate) fn fill_from(&self, values: Vec<V>) {
        debug_assert_eq!(values.len(), self.size);
        *self.data.write() = values;
    }
}

/// Bounded free-list of internal buffers.
///
/// All buffers are allocated up front; `allocate`/`release` are O(1) and never
/// touch the allocator. The pool is not thread-safe on its own; the scheduler
/// serializes access.
pub struct BlockPool<V> {
    free: Vec<Arc<InternalBlock<V>>>,
    capacity: usize,
    block_size: usize,
}

impl<V: BlockValue> BlockPool<V> {
    pub(crate) fn new(capacity: usize, block_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Arc::new(InternalBlock::new(block_size)))
            .collect();
        Self {
            free,
            capacity,
            block_size,
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<Arc<InternalBlock<V>>> {
        self.free.pop()
    }

    pub(crate) fn release(&mut self, buffer: Arc<InternalBlock<V>>) {
        debug_assert!(self.free.len() < self.capacity, "pool overfull");
        self.free.push(buffer);
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
