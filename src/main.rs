// # Blockswap Harness
//
// Exercises the block scheduler end to end against real files: round trips,
// forced eviction, dirty extraction, and trace-driven replay. Exit code 0
// when every selected case passes, 1 otherwise.

use blockswap::{
    BlockManager, BlockScheduler, InternalBlock, Placement, PredictionOp, SchedulerConfig,
    Strategy, VERSION,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const BLOCK_SIZE: usize = 1024;
type Value = u64;

type CaseResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(
    name = "blockswap-harness",
    version,
    about = "Block scheduler test harness"
)]
struct Cli {
    /// Number of the test case to run (all cases when omitted)
    #[arg(short = 't', long = "test-case")]
    test_case: Option<u32>,

    /// Internal memory to use, in megabytes
    #[arg(short = 'm', long = "memory", default_value_t = 256)]
    memory: u64,

    /// Directory for backing files (a temporary directory when omitted)
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,
}

fn ensure(cond: bool, what: &str) -> CaseResult {
    if cond {
        Ok(())
    } else {
        Err(what.to_string().into())
    }
}

fn config(data_dir: &str, memory_budget: u64) -> SchedulerConfig {
    SchedulerConfig {
        data_dir: data_dir.to_string(),
        num_files: 4,
        block_size: BLOCK_SIZE,
        memory_budget,
        placement: Placement::Striped,
    }
}

fn open_manager(data_dir: &str) -> blockswap::Result<Arc<BlockManager>> {
    Ok(Arc::new(BlockManager::open::<Value>(data_dir, 4, BLOCK_SIZE)?))
}

fn set_pattern_a(buffer: &InternalBlock<Value>) {
    for (i, v) in buffer.write().iter_mut().enumerate() {
        *v = i as Value;
    }
}

fn count_pattern_a_errors(buffer: &InternalBlock<Value>) -> usize {
    buffer
        .read()
        .iter()
        .enumerate()
        .filter(|&(i, &v)| v != i as Value)
        .count()
}

fn set_pattern_b(buffer: &InternalBlock<Value>) {
    let size = buffer.size() as Value;
    for (i, v) in buffer.write().iter_mut().enumerate() {
        *v = size - i as Value;
    }
}

fn count_pattern_b_errors(buffer: &InternalBlock<Value>) -> usize {
    let size = buffer.size() as Value;
    buffer
        .read()
        .iter()
        .enumerate()
        .filter(|&(i, &v)| v != size - i as Value)
        .count()
}

/// Case 1: the full operation surface on two blocks, starting from an
/// externally prepared block holding pattern A.
fn case_round_trip(data_dir: &str, memory_budget: u64) -> CaseResult {
    let bm = open_manager(data_dir)?;

    // Prepare an external block with pattern A.
    let ext = bm.new_block(Placement::Striped)?;
    let staging = Arc::new(InternalBlock::<Value>::new(BLOCK_SIZE));
    set_pattern_a(&staging);
    bm.write(staging.clone(), ext).wait()?;

    let mut bs = BlockScheduler::<Value>::new(&config(data_dir, memory_budget), bm.clone())?;
    ensure(!bs.is_simulating(), "scheduler started in simulation mode")?;

    let sbi1 = bs.allocate_swappable_block();
    ensure(!bs.is_initialized(sbi1), "fresh block reported initialized")?;

    bs.initialize(sbi1, ext);
    {
        let ib = bs.acquire(sbi1)?;
        ensure(
            count_pattern_a_errors(&ib) == 0,
            "initialized block does not hold pattern A",
        )?;
    }
    {
        // Re-fetch the binding and overwrite with pattern B.
        let ib = bs.get_internal_block(sbi1);
        set_pattern_b(&ib);
        bs.release(sbi1, true);
    }

    let sbi2 = bs.allocate_swappable_block();
    ensure(!bs.is_initialized(sbi2), "fresh block reported initialized")?;
    {
        let ib1 = bs.acquire(sbi1)?;
        let ib2 = bs.acquire(sbi2)?;
        let src = ib1.read();
        ib2.write().copy_from_slice(&src);
        drop(src);
        bs.release(sbi1, false);
        bs.release(sbi2, true);
    }
    ensure(bs.is_initialized(sbi1), "block 1 lost initialization")?;
    ensure(bs.is_initialized(sbi2), "block 2 lost initialization")?;

    let extracted = bs.extract_external_block(sbi2)?;
    ensure(
        !bs.is_initialized(sbi2),
        "block 2 still initialized after extraction",
    )?;
    bs.deinitialize(sbi1);
    ensure(
        !bs.is_initialized(sbi1),
        "block 1 still initialized after deinitialize",
    )?;
    bs.free_swappable_block(sbi1);
    bs.free_swappable_block(sbi2);
    bs.explicit_timestep();
    drop(bs);

    // The extracted block must hold pattern B.
    bm.read(staging.clone(), extracted).wait()?;
    ensure(
        count_pattern_b_errors(&staging) == 0,
        "extracted block does not hold pattern B",
    )?;
    bm.delete_block(extracted);
    Ok(())
}

/// Case 2: five blocks through a three-buffer pool; every re-acquire must
/// still observe pattern A, and swapping must actually happen.
fn case_forced_eviction(data_dir: &str) -> CaseResult {
    let bm = open_manager(data_dir)?;
    let budget = (BLOCK_SIZE * std::mem::size_of::<Value>() * 3) as u64;
    let mut bs = BlockScheduler::<Value>::new(&config(data_dir, budget), bm.clone())?;

    let ids: Vec<_> = (0..5).map(|_| bs.allocate_swappable_block()).collect();
    for &id in &ids {
        let ib = bs.acquire(id)?;
        set_pattern_a(&ib);
        bs.release(id, true);
    }

    for &id in &[ids[3], ids[4], ids[2], ids[0]] {
        let ib = bs.acquire(id)?;
        ensure(
            count_pattern_a_errors(&ib) == 0,
            "re-acquired block lost pattern A",
        )?;
        bs.release(id, false);
    }

    let stats = bm.stats();
    ensure(stats.writes >= 2, "expected at least two writebacks")?;
    ensure(stats.reads >= 2, "expected at least two reads")?;

    for &id in &ids {
        bs.deinitialize(id);
        bs.free_swappable_block(id);
    }
    Ok(())
}

/// Case 3: dirty contents survive extraction.
fn case_dirty_extraction(data_dir: &str) -> CaseResult {
    let bm = open_manager(data_dir)?;
    let budget = (BLOCK_SIZE * std::mem::size_of::<Value>()) as u64;
    let mut bs = BlockScheduler::<Value>::new(&config(data_dir, budget), bm.clone())?;

    let id = bs.allocate_swappable_block();
    {
        let ib = bs.acquire(id)?;
        set_pattern_b(&ib);
    }
    bs.release(id, true);
    let handle = bs.extract_external_block(id)?;
    bs.free_swappable_block(id);
    drop(bs);

    let staging = Arc::new(InternalBlock::<Value>::new(BLOCK_SIZE));
    bm.read(staging.clone(), handle).wait()?;
    ensure(
        count_pattern_b_errors(&staging) == 0,
        "extracted block does not hold pattern B",
    )?;
    bm.delete_block(handle);
    Ok(())
}

/// The operation sequence recorded and replayed in cases 4 and 5.
fn scripted_ops(bs: &mut BlockScheduler<Value>) -> CaseResult {
    let sbi = bs.allocate_swappable_block();
    bs.acquire(sbi)?;
    bs.acquire(sbi)?;
    bs.release(sbi, true);
    bs.explicit_timestep();
    bs.release(sbi, false);
    bs.deinitialize(sbi);
    bs.initialize(sbi, Default::default());
    bs.extract_external_block(sbi)?;
    bs.free_swappable_block(sbi);
    Ok(())
}

/// Case 4: record a trace under simulation, check its shape, then replay it
/// under the offline LFD strategy.
fn case_simulation_replay(data_dir: &str, memory_budget: u64) -> CaseResult {
    let bm = open_manager(data_dir)?;
    let mut bs = BlockScheduler::<Value>::new(&config(data_dir, memory_budget), bm)?;

    bs.switch_algorithm_to(Strategy::simulation())?;
    ensure(bs.is_simulating(), "simulation strategy not active")?;
    scripted_ops(&mut bs)?;

    let trace = bs.get_prediction_sequence();
    for entry in trace.iter() {
        info!(block = entry.id, op = %entry.op, time = entry.time, "recorded");
    }
    ensure(trace.len() == 7, "trace should hold exactly seven entries")?;
    let expected = [
        PredictionOp::AcquireDirty,
        PredictionOp::Acquire,
        PredictionOp::ReleaseDirty,
        PredictionOp::Release,
        PredictionOp::Deinitialize,
        PredictionOp::Initialize,
        PredictionOp::Extract,
    ];
    for (entry, want) in trace.iter().zip(expected) {
        ensure(entry.op == want, "trace op order diverges")?;
    }
    let times: Vec<u64> = trace.iter().map(|e| e.time).collect();
    ensure(
        times.windows(2).all(|w| w[0] <= w[1]),
        "trace times must be non-decreasing",
    )?;
    ensure(times[3] > times[2], "explicit timestep did not advance time")?;

    bs.switch_algorithm_to(Strategy::offline_lfd(trace))?;
    ensure(!bs.is_simulating(), "LFD strategy reported simulating")?;
    scripted_ops(&mut bs)?;
    Ok(())
}

/// Case 5: record the forced-eviction workload, then replay it under the
/// LRU-prefetch strategy and verify contents on every acquire.
fn case_prefetch_replay(data_dir: &str) -> CaseResult {
    let bm = open_manager(data_dir)?;
    let budget = (BLOCK_SIZE * std::mem::size_of::<Value>() * 3) as u64;
    let mut bs = BlockScheduler::<Value>::new(&config(data_dir, budget), bm.clone())?;

    let workload = |bs: &mut BlockScheduler<Value>, check: bool| -> CaseResult {
        let ids: Vec<_> = (0..5).map(|_| bs.allocate_swappable_block()).collect();
        for &id in &ids {
            let ib = bs.acquire(id)?;
            if check {
                // Contents are meaningless while simulating, so only the
                // replay writes the pattern.
                set_pattern_a(&ib);
            }
            bs.release(id, true);
        }
        for &id in &[ids[1], ids[4], ids[0]] {
            let ib = bs.acquire(id)?;
            if check {
                ensure(
                    count_pattern_a_errors(&ib) == 0,
                    "replayed block lost pattern A",
                )?;
            }
            bs.release(id, false);
        }
        for &id in &ids {
            bs.deinitialize(id);
            bs.free_swappable_block(id);
        }
        Ok(())
    };

    bs.switch_algorithm_to(Strategy::simulation())?;
    workload(&mut bs, false)?;
    let trace = bs.get_prediction_sequence();

    bs.switch_algorithm_to(Strategy::offline_lru_prefetch(trace))?;
    workload(&mut bs, true)?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    let cli = Cli::parse();
    let memory_budget = cli.memory * 1024 * 1024;

    let data_root = cli.data_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("blockswap-harness-{}", std::process::id()))
    });
    info!(version = VERSION, data_dir = %data_root.display(), "harness starting");

    let cases: Vec<(u32, &str, Box<dyn Fn(&str) -> CaseResult>)> = vec![
        (
            1,
            "round trip",
            Box::new(move |dir: &str| case_round_trip(dir, memory_budget)),
        ),
        (2, "forced eviction", Box::new(case_forced_eviction)),
        (3, "dirty extraction", Box::new(case_dirty_extraction)),
        (
            4,
            "simulation and LFD replay",
            Box::new(move |dir: &str| case_simulation_replay(dir, memory_budget)),
        ),
        (5, "LRU-prefetch replay", Box::new(case_prefetch_replay)),
    ];

    let mut failures = 0;
    for (number, name, run) in &cases {
        if cli.test_case.is_some_and(|selected| selected != *number) {
            continue;
        }
        let case_dir = data_root.join(format!("case-{number}"));
        let dir = case_dir.display().to_string();
        match run(&dir) {
            Ok(()) => info!(case = number, name, "passed"),
            Err(e) => {
                error!(case = number, name, error = %e, "failed");
                failures += 1;
            }
        }
    }

    let _ = std::fs::remove_dir_all(&data_root);
    if failures > 0 {
        std::process::exit(1);
    }
}
