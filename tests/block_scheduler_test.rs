// End-to-end scenarios for the block scheduler: round trips through external
// storage, forced eviction, extraction, trace recording and replay, and the
// fatal contract checks.

use blockswap::{
    BlockManager, BlockScheduler, ExternalHandle, InternalBlock, Placement, PredictionOp,
    SchedulerConfig, Strategy,
};
use std::sync::Arc;
use tempfile::tempdir;

const BLOCK_SIZE: usize = 1024;
type Value = u64;

fn setup(
    budget_blocks: u64,
) -> (BlockScheduler<Value>, Arc<BlockManager>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();
    let bm = Arc::new(BlockManager::open::<Value>(&data_dir, 4, BLOCK_SIZE).unwrap());
    let config = SchedulerConfig {
        data_dir,
        num_files: 4,
        block_size: BLOCK_SIZE,
        memory_budget: budget_blocks * (BLOCK_SIZE * std::mem::size_of::<Value>()) as u64,
        placement: Placement::Striped,
    };
    let bs = BlockScheduler::new(&config, bm.clone()).unwrap();
    (bs, bm, dir)
}

fn set_pattern_a(buffer: &InternalBlock<Value>) {
    for (i, v) in buffer.write().iter_mut().enumerate() {
        *v = i as Value;
    }
}

fn holds_pattern_a(buffer: &InternalBlock<Value>) -> bool {
    buffer.read().iter().enumerate().all(|(i, &v)| v == i as Value)
}

fn set_pattern_b(buffer: &InternalBlock<Value>) {
    for (i, v) in buffer.write().iter_mut().enumerate() {
        *v = (BLOCK_SIZE - i) as Value;
    }
}

fn holds_pattern_b(buffer: &InternalBlock<Value>) -> bool {
    buffer
        .read()
        .iter()
        .enumerate()
        .all(|(i, &v)| v == (BLOCK_SIZE - i) as Value)
}

#[test]
fn single_block_round_trip() {
    let (mut bs, bm, _dir) = setup(1);

    // Prepare an external block holding pattern A.
    let ext = bm.new_block(Placement::Striped).unwrap();
    let staging = Arc::new(InternalBlock::<Value>::new(BLOCK_SIZE));
    set_pattern_a(&staging);
    bm.write(staging, ext).wait().unwrap();
    let writes_after_seed = bm.stats().writes;

    let id = bs.allocate_swappable_block();
    assert!(!bs.is_initialized(id));
    bs.initialize(id, ext);
    assert!(bs.is_initialized(id));

    {
        let ib = bs.acquire(id).unwrap();
        assert!(holds_pattern_a(&ib));
    }
    bs.release(id, false);

    bs.deinitialize(id);
    bs.free_swappable_block(id);

    // A clean round trip issues no writeback.
    assert_eq!(bm.stats().writes, writes_after_seed);
    assert_eq!(bm.stats().reads, 1);
}

#[test]
fn forced_eviction_preserves_contents() {
    let (mut bs, bm, _dir) = setup(3);

    let ids: Vec<_> = (0..5).map(|_| bs.allocate_swappable_block()).collect();
    for &id in &ids {
        let ib = bs.acquire(id).unwrap();
        set_pattern_a(&ib);
        bs.release(id, true);
    }

    // Only three buffers exist, so at least two blocks were swapped out.
    for &id in &[ids[3], ids[4], ids[2]] {
        let ib = bs.acquire(id).unwrap();
        assert!(holds_pattern_a(&ib), "block {id} lost its contents");
        bs.release(id, false);
    }

    let stats = bm.stats();
    assert!(stats.writes >= 2, "expected at least two writebacks");
    assert!(stats.reads >= 2, "expected at least two reads");

    for &id in &ids {
        bs.deinitialize(id);
        bs.free_swappable_block(id);
    }
}

#[test]
fn dirty_contents_survive_extraction() {
    let (mut bs, bm, _dir) = setup(1);

    let id = bs.allocate_swappable_block();
    {
        let ib = bs.acquire(id).unwrap();
        set_pattern_b(&ib);
    }
    bs.release(id, true);

    let handle = bs.extract_external_block(id).unwrap();
    assert!(handle.is_valid());
    assert!(!bs.is_initialized(id));
    bs.free_swappable_block(id);

    let staging = Arc::new(InternalBlock::<Value>::new(BLOCK_SIZE));
    bm.read(staging.clone(), handle).wait().unwrap();
    assert!(holds_pattern_b(&staging));
    bm.delete_block(handle);
}

#[test]
fn extraction_returns_the_adopted_handle() {
    let (mut bs, bm, _dir) = setup(1);

    let handle = bm.new_block(Placement::Randomized).unwrap();
    let id = bs.allocate_swappable_block();
    bs.initialize(id, handle);
    let extracted = bs.extract_external_block(id).unwrap();
    assert_eq!(extracted, handle);
    bs.free_swappable_block(id);
    bm.delete_block(handle);
}

fn scripted_ops(bs: &mut BlockScheduler<Value>) {
    let id = bs.allocate_swappable_block();
    bs.acquire(id).unwrap();
    bs.acquire(id).unwrap();
    bs.release(id, true);
    bs.explicit_timestep();
    bs.release(id, false);
    bs.deinitialize(id);
    bs.initialize(id, ExternalHandle::default());
    bs.extract_external_block(id).unwrap();
    bs.free_swappable_block(id);
}

#[test]
fn simulation_records_a_faithful_trace() {
    let (mut bs, bm, _dir) = setup(1);

    bs.switch_algorithm_to(Strategy::simulation()).unwrap();
    assert!(bs.is_simulating());
    scripted_ops(&mut bs);

    let trace = bs.get_prediction_sequence();
    let ops: Vec<PredictionOp> = trace.iter().map(|e| e.op).collect();
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

    let times: Vec<u64> = trace.iter().map(|e| e.time).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    // The explicit timestep between the releases advanced time.
    assert!(times[3] > times[2]);

    // Simulation performed no I/O at all.
    let stats = bm.stats();
    assert_eq!((stats.reads, stats.writes), (0, 0));
}

#[test]
fn lfd_replays_the_recorded_trace() {
    let (mut bs, _bm, _dir) = setup(1);

    bs.switch_algorithm_to(Strategy::simulation()).unwrap();
    scripted_ops(&mut bs);
    let trace = bs.get_prediction_sequence();

    bs.switch_algorithm_to(Strategy::offline_lfd(trace)).unwrap();
    assert!(!bs.is_simulating());
    scripted_ops(&mut bs);
}

/// The same workload, run under any strategy; verifies buffer contents on
/// every acquire when `check` is set.
fn eviction_workload(bs: &mut BlockScheduler<Value>, check: bool) {
    let ids: Vec<_> = (0..5).map(|_| bs.allocate_swappable_block()).collect();
    for (n, &id) in ids.iter().enumerate() {
        let ib = bs.acquire(id).unwrap();
        if check {
            let fill = n as Value;
            ib.write().fill(fill);
        }
        bs.release(id, true);
    }
    for &n in &[1usize, 4, 0, 2] {
        let ib = bs.acquire(ids[n]).unwrap();
        if check {
            assert!(
                ib.read().iter().all(|&v| v == n as Value),
                "block {n} lost its contents during replay"
            );
        }
        bs.release(ids[n], false);
    }
    for &id in &ids {
        bs.deinitialize(id);
        bs.free_swappable_block(id);
    }
}

#[test]
fn lfd_replay_observes_identical_contents() {
    let (mut bs, _bm, _dir) = setup(3);

    bs.switch_algorithm_to(Strategy::simulation()).unwrap();
    eviction_workload(&mut bs, false);
    let trace = bs.get_prediction_sequence();

    bs.switch_algorithm_to(Strategy::offline_lfd(trace)).unwrap();
    eviction_workload(&mut bs, true);
}

#[test]
fn lru_prefetch_replay_observes_identical_contents() {
    let (mut bs, _bm, _dir) = setup(3);

    bs.switch_algorithm_to(Strategy::simulation()).unwrap();
    eviction_workload(&mut bs, false);
    let trace = bs.get_prediction_sequence();

    bs.switch_algorithm_to(Strategy::offline_lru_prefetch(trace))
        .unwrap();
    eviction_workload(&mut bs, true);
}

#[test]
fn switching_back_to_online_inherits_the_resident_set() {
    let (mut bs, _bm, _dir) = setup(3);

    bs.switch_algorithm_to(Strategy::simulation()).unwrap();
    eviction_workload(&mut bs, false);
    let trace = bs.get_prediction_sequence();
    bs.switch_algorithm_to(Strategy::offline_lfd(trace)).unwrap();
    eviction_workload(&mut bs, true);

    // Back to online; the scheduler keeps working on fresh blocks.
    bs.switch_algorithm_to(Strategy::online()).unwrap();
    let id = bs.allocate_swappable_block();
    {
        let ib = bs.acquire(id).unwrap();
        set_pattern_a(&ib);
    }
    bs.release(id, true);
    let ib = bs.acquire(id).unwrap();
    assert!(holds_pattern_a(&ib));
    bs.release(id, false);
    bs.deinitialize(id);
    bs.free_swappable_block(id);
}

#[test]
#[should_panic(expected = "without a matching acquire")]
fn over_release_aborts() {
    let (mut bs, _bm, _dir) = setup(1);
    let id = bs.allocate_swappable_block();
    bs.acquire(id).unwrap();
    bs.release(id, false);
    bs.release(id, false);
}

#[test]
#[should_panic(expected = "free_swappable_block of acquired block")]
fn freeing_an_acquired_block_aborts() {
    let (mut bs, _bm, _dir) = setup(1);
    let id = bs.allocate_swappable_block();
    bs.acquire(id).unwrap();
    bs.free_swappable_block(id);
}

#[test]
#[should_panic(expected = "free_swappable_block of initialized block")]
fn freeing_an_initialized_block_aborts() {
    let (mut bs, _bm, _dir) = setup(1);
    let id = bs.allocate_swappable_block();
    bs.acquire(id).unwrap();
    bs.release(id, true);
    bs.free_swappable_block(id);
}

#[test]
#[should_panic(expected = "uninitialized block")]
fn extracting_an_uninitialized_block_aborts() {
    let (mut bs, _bm, _dir) = setup(1);
    let id = bs.allocate_swappable_block();
    let _ = bs.extract_external_block(id);
}

#[test]
fn leaked_blocks_are_tolerated_at_shutdown() {
    // The scheduler's drop cleans up blocks the client never released,
    // deinitialized, or freed.
    let (mut bs, _bm, _dir) = setup(1);
    let id = bs.allocate_swappable_block();
    bs.acquire(id).unwrap();
    drop(bs);
}
