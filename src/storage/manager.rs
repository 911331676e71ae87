// # External Block Manager - File-Pool-Backed Block Storage
//
// Allocates fixed-size block slots across a pool of backing files and serves
// asynchronous reads and writes against them. Placement is either striped
// (round-robin across files) or randomized. Freed slots are reused before the
// files are grown.
//
// The manager is a collaborator of the block scheduler: it owns no scheduling
// state and can be shared (`Arc`) by everything that performs block I/O.

use crate::error::{fatal, Result, SchedulerError};
use crate::scheduler::pool::{BlockValue, InternalBlock};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

/// Reference to a block-sized region in the manager's file pool.
///
/// The default value is an explicit invalid sentinel; it compares equal to
/// itself, so handle identity survives round trips through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalHandle {
    file: u32,
    slot: u64,
}

impl ExternalHandle {
    pub const INVALID: ExternalHandle = ExternalHandle {
        file: u32::MAX,
        slot: u64::MAX,
    };

    pub(crate) fn new(file: u32, slot: u64) -> Self {
        Self { file, slot }
    }

    pub fn is_valid(&self) -> bool {
        self.file != u32::MAX
    }
}

impl Default for ExternalHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Allocation strategy for new external blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Round-robin across the file pool.
    Striped,
    /// Uniformly random file choice.
    Randomized,
}

/// I/O and allocation counters.
#[derive(Debug, Clone, Default)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Handle to an in-flight asynchronous block transfer.
///
/// Uniquely owned; `wait` consumes the request and surfaces any I/O error
/// from the worker.
pub struct IoRequest {
    join: JoinHandle<Result<()>>,
    kind: IoKind,
}

impl IoRequest {
    pub fn kind(&self) -> IoKind {
        self.kind
    }

    pub fn wait(self) -> Result<()> {
        match self.join.join() {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Storage(
                "I/O worker thread panicked".to_string(),
            )),
        }
    }
}

fn codec_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
> {
    bincode::config::standard().with_fixed_int_encoding()
}

/// On-disk footprint of one encoded buffer of `block_size` elements.
pub fn encoded_block_size<V: BlockValue>(block_size: usize) -> usize {
    let probe = vec![V::default(); block_size];
    bincode::serde::encode_to_vec(&probe, codec_config())
        .map(|bytes| bytes.len())
        .unwrap_or(0)
}

struct AllocState {
    next_slot: Vec<u64>,
    free: Vec<ExternalHandle>,
}

pub struct BlockManager {
    files: Vec<Arc<Mutex<File>>>,
    block_bytes: usize,
    next_file: AtomicUsize,
    alloc: Mutex<AllocState>,
    stats: Arc<RwLock<IoStats>>,
}

impl BlockManager {
    /// Create or open a pool of `num_files` backing files under `data_dir`,
    /// sized for blocks of `block_size` elements of `V`.
    pub fn open<V: BlockValue>(
        data_dir: &str,
        num_files: usize,
        block_size: usize,
    ) -> Result<Self> {
        if num_files == 0 {
            return Err(SchedulerError::Config(
                "block manager needs at least one backing file".to_string(),
            ));
        }
        std::fs::create_dir_all(data_dir)?;

        let block_bytes = encoded_block_size::<V>(block_size);
        if block_bytes == 0 {
            return Err(SchedulerError::Config(
                "block footprint encodes to zero bytes".to_string(),
            ));
        }

        let mut files = Vec::with_capacity(num_files);
        for i in 0..num_files {
            let mut path = PathBuf::from(data_dir);
            path.push(format!("pool-{i:02}.dat"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            files.push(Arc::new(Mutex::new(file)));
        }

        Ok(Self {
            files,
            block_bytes,
            next_file: AtomicUsize::new(0),
            alloc: Mutex::new(AllocState {
                next_slot: vec![0; num_files],
                free: Vec::new(),
            }),
            stats: Arc::new(RwLock::new(IoStats::default())),
        })
    }

    /// Encoded size in bytes of one block slot.
    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Allocate a fresh external block. Freed slots are reused first.
    pub fn new_block(&self, placement: Placement) -> Result<ExternalHandle> {
        let handle = {
            let mut alloc = self.alloc.lock();
            if let Some(handle) = alloc.free.pop() {
                handle
            } else {
                let file = match placement {
                    Placement::Striped => {
                        self.next_file.fetch_add(1, Ordering::Relaxed) % self.files.len()
                    }
                    Placement::Randomized => rand::rng().random_range(0..self.files.len()),
                };
                let slot = alloc.next_slot[file];
                alloc.next_slot[file] += 1;
                ExternalHandle::new(file as u32, slot)
            }
        };

        // Grow the backing file so reads of never-written slots see zeroes
        // instead of hitting EOF.
        let needed = (handle.slot + 1) * self.block_bytes as u64;
        {
            let file = self.files[handle.file as usize].lock();
            if file.metadata()?.len() < needed {
                file.set_len(needed)?;
            }
        }

        self.stats.write().blocks_allocated += 1;
        trace!(file = handle.file, slot = handle.slot, "allocated external block");
        Ok(handle)
    }

    /// Return a block slot to the free list.
    pub fn delete_block(&self, handle: ExternalHandle) {
        if !handle.is_valid() {
            fatal!("delete_block called with an invalid external handle");
        }
        self.alloc.lock().free.push(handle);
        self.stats.write().blocks_freed += 1;
        trace!(file = handle.file, slot = handle.slot, "freed external block");
    }

    /// Start an asynchronous read of `handle` into `buffer`.
    pub fn read<V: BlockValue>(
        &self,
        buffer: Arc<InternalBlock<V>>,
        handle: ExternalHandle,
    ) -> IoRequest {
        if !handle.is_valid() {
            fatal!("read requested for an invalid external handle");
        }
        let file = self.files[handle.file as usize].clone();
        let offset = handle.slot * self.block_bytes as u64;
        let nbytes = self.block_bytes;
        let stats = self.stats.clone();

        let join = thread::spawn(move || -> Result<()> {
            let mut bytes = vec![0u8; nbytes];
            {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut bytes)?;
            }
            let (values, _len): (Vec<V>, usize) =
                bincode::serde::decode_from_slice(&bytes, codec_config())
                    .map_err(|e| SchedulerError::Codec(e.to_string()))?;
            buffer.fill_from(values);

            let mut stats = stats.write();
            stats.reads += 1;
            stats.bytes_read += nbytes as u64;
            Ok(())
        });

        IoRequest {
            join,
            kind: IoKind::Read,
        }
    }

    /// Start an asynchronous write of `buffer` to `handle`.
    pub fn write<V: BlockValue>(
        &self,
        buffer: Arc<InternalBlock<V>>,
        handle: ExternalHandle,
    ) -> IoRequest {
        if !handle.is_valid() {
            fatal!("write requested for an invalid external handle");
        }
        let file = self.files[handle.file as usize].clone();
        let offset = handle.slot * self.block_bytes as u64;
        let nbytes = self.block_bytes;
        let stats = self.stats.clone();

        let join = thread::spawn(move || -> Result<()> {
            let bytes = {
                let guard = buffer.read();
                bincode::serde::encode_to_vec(&*guard, codec_config())
                    .map_err(|e| SchedulerError::Codec(e.to_string()))?
            };
            if bytes.len() != nbytes {
                return Err(SchedulerError::Codec(format!(
                    "encoded block is {} bytes, slot is {} bytes",
                    bytes.len(),
                    nbytes
                )));
            }
            {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&bytes)?;
            }

            let mut stats = stats.write();
            stats.writes += 1;
            stats.bytes_written += nbytes as u64;
            Ok(())
        });

        IoRequest {
            join,
            kind: IoKind::Write,
        }
    }

    pub fn stats(&self) -> IoStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_buffer(values: &[u64]) -> Arc<InternalBlock<u64>> {
        let buf = Arc::new(InternalBlock::new(values.len()));
        buf.write().copy_from_slice(values);
        buf
    }

    #[test]
    fn write_read_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let bm = BlockManager::open::<u64>(dir.path().to_str().unwrap(), 2, 64)?;

        let handle = bm.new_block(Placement::Striped)?;
        let pattern: Vec<u64> = (0..64).collect();
        bm.write(test_buffer(&pattern), handle).wait()?;

        let out = Arc::new(InternalBlock::<u64>::new(64));
        bm.read(out.clone(), handle).wait()?;
        assert_eq!(&*out.read(), &pattern);

        let stats = bm.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        Ok(())
    }

    #[test]
    fn striping_distributes_across_files() -> Result<()> {
        let dir = tempdir().unwrap();
        let bm = BlockManager::open::<u64>(dir.path().to_str().unwrap(), 3, 16)?;

        let handles: Vec<ExternalHandle> = (0..6)
            .map(|_| bm.new_block(Placement::Striped))
            .collect::<Result<_>>()?;
        let mut per_file = [0usize; 3];
        for h in &handles {
            per_file[h.file as usize] += 1;
        }
        assert_eq!(per_file, [2, 2, 2]);
        Ok(())
    }

    #[test]
    fn freed_slots_are_reused() -> Result<()> {
        let dir = tempdir().unwrap();
        let bm = BlockManager::open::<u64>(dir.path().to_str().unwrap(), 1, 16)?;

        let first = bm.new_block(Placement::Striped)?;
        bm.delete_block(first);
        let second = bm.new_block(Placement::Striped)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn default_handle_is_invalid() {
        assert!(!ExternalHandle::default().is_valid());
        assert_eq!(ExternalHandle::default(), ExternalHandle::INVALID);
    }
}
