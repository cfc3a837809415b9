//! RowNumber under a memory cap: spilled runs must match unconstrained runs.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_core::{Column, ExecConfig, PlanBuilder, RowBatch, Scalar, SpillStats};
use strata_exec::{QueryCtx, Task, TaskState};
use strata_operators::BatchConsumer;

const NUM_KEYS: i64 = 100_000;
const BATCH_ROWS: i64 = 10_000;

fn key_batches(num_keys: i64, batch_rows: i64) -> Vec<RowBatch> {
    (0..num_keys)
        .step_by(batch_rows as usize)
        .map(|start| {
            let keys = (start..start + batch_rows).map(Scalar::I64).collect();
            RowBatch::new(vec![Column::new("k", keys)])
        })
        .collect()
}

/// Run RowNumber over every key three times; returns sorted
/// (key, row number) pairs and the task's spill stats.
fn run_row_number(config: ExecConfig, limit: Option<usize>) -> (Vec<(i64, i64)>, SpillStats) {
    run_row_number_over(key_batches(NUM_KEYS, BATCH_ROWS), 3, config, limit)
}

fn run_row_number_over(
    batches: Vec<RowBatch>,
    repeats: usize,
    config: ExecConfig,
    limit: Option<usize>,
) -> (Vec<(i64, i64)>, SpillStats) {
    let ctx = QueryCtx::new(config).unwrap();
    let out = Arc::new(Mutex::new(Vec::new()));
    let consumer: BatchConsumer = {
        let out = Arc::clone(&out);
        Arc::new(move |batch: RowBatch| {
            let keys = &batch.column("k").unwrap().values;
            let numbers = &batch.column("row_number").unwrap().values;
            let mut out = out.lock().unwrap();
            for (k, rn) in keys.iter().zip(numbers) {
                out.push((k.as_i64().unwrap(), rn.as_i64().unwrap()));
            }
            None
        })
    };
    let plan = PlanBuilder::new()
        .values_repeated(batches, false, repeats)
        .row_number(vec!["k".to_string()], limit, true)
        .plan_node()
        .unwrap();
    let task = Task::create("row-number", plan, ctx, Some(consumer)).unwrap();
    task.start(4).unwrap();
    assert_eq!(task.num_total_drivers(), 1);
    assert!(task
        .task_completion_future()
        .wait_for(Duration::from_secs(300)));
    assert_eq!(task.state(), TaskState::Finished, "{:?}", task.error());

    let mut rows = std::mem::take(&mut *out.lock().unwrap());
    rows.sort_unstable();
    (rows, task.task_stats().spill_stats())
}

fn capped_config(spill_dir: &std::path::Path) -> ExecConfig {
    ExecConfig {
        executor_threads: 2,
        mem_cap_bytes: 2 << 20,
        spill_enabled: true,
        spill_dir: spill_dir.to_string_lossy().into_owned(),
        ..Default::default()
    }
}

#[test]
fn tiny_memory_cap_spills_and_matches_uncapped_run() {
    let uncapped = ExecConfig {
        executor_threads: 2,
        ..Default::default()
    };
    let (expected, stats) = run_row_number(uncapped, None);
    assert_eq!(expected.len(), 3 * NUM_KEYS as usize);
    assert!(stats.empty());

    let dir = tempfile::tempdir().unwrap();
    let (actual, stats) = run_row_number(capped_config(dir.path()), None);
    assert!(stats.spill_runs >= 1, "{stats}");
    assert!(stats.spilled_partitions >= 1, "{stats}");
    assert!(stats.spilled_rows > 0);
    assert!(stats.spill_reads > 0);
    assert_eq!(actual, expected);
}

#[test]
fn limit_applies_across_spilled_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let (rows, stats) = run_row_number(capped_config(dir.path()), Some(2));
    assert!(stats.spill_runs >= 1);
    assert_eq!(rows.len(), 2 * NUM_KEYS as usize);
    assert!(rows.iter().all(|&(_, rn)| rn == 1 || rn == 2));
    assert_eq!(rows[0], (0, 1));
    assert_eq!(rows[1], (0, 2));
}

#[test]
fn memory_storage_spill_uri() {
    let config = ExecConfig {
        executor_threads: 2,
        mem_cap_bytes: 2 << 20,
        spill_enabled: true,
        spill_uri: Some("memory://".into()),
        ..Default::default()
    };
    let (rows, stats) = run_row_number(config, Some(1));
    assert!(stats.spill_runs >= 1);
    assert_eq!(rows.len(), NUM_KEYS as usize);
    assert!(rows.iter().enumerate().all(|(i, &(k, rn))| k == i as i64 && rn == 1));
}

#[test]
fn partitions_larger_than_the_cap_spill_recursively() {
    let batches = key_batches(40_000, 250);
    let uncapped = ExecConfig {
        executor_threads: 2,
        ..Default::default()
    };
    let (expected, _) = run_row_number_over(batches.clone(), 2, uncapped, None);
    assert_eq!(expected.len(), 80_000);

    // Level-0 partitions hold about 5000 keys each, well past 128KiB.
    let config = ExecConfig {
        executor_threads: 2,
        mem_cap_bytes: 128 << 10,
        spill_enabled: true,
        spill_uri: Some("memory://".into()),
        ..Default::default()
    };
    let (actual, stats) = run_row_number_over(batches, 2, config, None);
    assert!(stats.spill_runs >= 2, "{stats}");
    assert_eq!(stats.spill_max_level_exceeded_count, 0, "{stats}");
    assert_eq!(actual, expected);
}
