// # Prediction Trace - Recorded Operation Sequence for Offline Strategies
//
// The simulation strategy appends one entry per client operation; the offline
// strategies replay the frozen sequence and verify that the live operation
// stream matches it exactly.

use crate::error::fatal;
use crate::scheduler::block::SwappableBlockId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionOp {
    /// Acquire of a block that already has contents.
    Acquire,
    /// Acquire that itself initializes the block: no read is needed at
    /// replay and the buffer must be written back on eviction.
    AcquireDirty,
    Release,
    ReleaseDirty,
    Deinitialize,
    Initialize,
    Extract,
}

impl fmt::Display for PredictionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PredictionOp::Acquire => "acquire",
            PredictionOp::AcquireDirty => "acquire-dirty",
            PredictionOp::Release => "release",
            PredictionOp::ReleaseDirty => "release-dirty",
            PredictionOp::Deinitialize => "deinitialize",
            PredictionOp::Initialize => "initialize",
            PredictionOp::Extract => "extract",
        };
        f.write_str(name)
    }
}

impl PredictionOp {
    pub fn is_acquire(&self) -> bool {
        matches!(self, PredictionOp::Acquire | PredictionOp::AcquireDirty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionEntry {
    pub id: SwappableBlockId,
    pub op: PredictionOp,
    pub time: u64,
}

/// Ordered, append-only operation log with O(1) append and positional access.
/// Frozen once a strategy switch hands it to an offline consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionSequence {
    entries: Vec<PredictionEntry>,
}

impl PredictionSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, id: SwappableBlockId, op: PredictionOp, time: u64) {
        self.entries.push(PredictionEntry { id, op, time });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&PredictionEntry> {
        self.entries.get(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PredictionEntry> {
        self.entries.iter()
    }
}

/// Cursor over a frozen prediction sequence.
///
/// The offline strategies use it both to verify the live operation stream
/// and to look ahead for prefetch planning.
pub struct TraceCursor {
    seq: Arc<PredictionSequence>,
    pos: usize,
}

impl TraceCursor {
    pub fn new(seq: Arc<PredictionSequence>) -> Self {
        Self { seq, pos: 0 }
    }

    pub fn sequence(&self) -> &Arc<PredictionSequence> {
        &self.seq
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<PredictionEntry> {
        let entry = self.seq.get(self.pos).copied();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    /// Verify that the live operation matches the trace head, then advance.
    /// A deviation from the recorded sequence is a programming error.
    pub(crate) fn expect(&mut self, id: SwappableBlockId, op: PredictionOp) -> PredictionEntry {
        match self.seq.get(self.pos) {
            Some(&entry) if entry.id == id && entry.op == op => {
                self.pos += 1;
                entry
            }
            Some(&entry) => {
                fatal!(
                    "operation mismatch at trace position {}: recorded {} of block {}, live {} of block {}",
                    self.pos,
                    entry.op,
                    entry.id,
                    op,
                    id
                );
            }
            None => {
                fatal!(
                    "live {} of block {} runs past the end of the prediction sequence ({} entries)",
                    op,
                    id,
                    self.seq.len()
                );
            }
        }
    }
}
