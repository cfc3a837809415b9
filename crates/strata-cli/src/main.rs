//! strata CLI: run demo pipelines on the driver runtime.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use strata_core::{Column, ExecConfig, PlanBuilder, PlanNode, RowBatch, Scalar};
use strata_exec::{QueryCtx, Task, TaskState};
use strata_operators::BatchConsumer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "strata: a push-based query driver runtime with cooperative pause, cancel and spill", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct CommonArgs {
    /// Memory cap in bytes (overrides STRATA_MEM_CAP_BYTES)
    #[arg(long)]
    memory_cap: Option<usize>,

    /// Executor threads (overrides STRATA_EXECUTOR_THREADS)
    #[arg(long)]
    threads: Option<usize>,

    /// Driver time slice in ms, 0 disables (overrides STRATA_DRIVER_CPU_SLICE_MS)
    #[arg(long)]
    time_slice_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a values -> filter pipeline, or a JSON plan
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// JSON plan file; a generated values -> filter plan when absent
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// Number of drivers
        #[arg(long, default_value_t = 4)]
        drivers: usize,

        /// Batches in the values node
        #[arg(long, default_value_t = 10)]
        batches: usize,

        /// Rows per batch
        #[arg(long, default_value_t = 1000)]
        rows: usize,

        /// How many times each driver replays the batches
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Filter predicate for the generated plan
        #[arg(long, default_value = "c0 % 10 == 0")]
        predicate: String,

        /// Cancel the task once this many rows were produced
        #[arg(long)]
        cancel_after_rows: Option<u64>,

        /// Pause the task right after start for this many ms, then resume
        #[arg(long)]
        pause_ms: Option<u64>,
    },

    /// Run RowNumber over many keys under a memory cap and report spilling
    Spill {
        #[command(flatten)]
        common: CommonArgs,

        /// Distinct partition keys
        #[arg(long, default_value_t = 100_000)]
        keys: usize,

        /// Rows per key
        #[arg(long, default_value_t = 3)]
        repeat: usize,

        /// Per-partition row limit
        #[arg(long)]
        limit: Option<usize>,

        /// Spill directory (overrides STRATA_SPILL_DIR)
        #[arg(long)]
        spill_dir: Option<String>,

        /// Spill URI, e.g. memory:// or file:///tmp/spill
        #[arg(long)]
        spill_uri: Option<String>,

        /// Spill codec: none, zstd or lz4
        #[arg(long)]
        compression: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            common,
            plan,
            drivers,
            batches,
            rows,
            repeat,
            predicate,
            cancel_after_rows,
            pause_ms,
        } => run_pipeline(RunOptions {
            common,
            plan,
            drivers,
            batches,
            rows,
            repeat,
            predicate,
            cancel_after_rows,
            pause_ms,
        }),
        Commands::Spill {
            common,
            keys,
            repeat,
            limit,
            spill_dir,
            spill_uri,
            compression,
        } => {
            let mut config = build_config(&common);
            config.spill_enabled = true;
            if let Some(dir) = spill_dir {
                config.spill_dir = dir;
            }
            if let Some(uri) = spill_uri {
                config.spill_uri = Some(uri);
            }
            if let Some(codec) = compression {
                config.spill_compression = codec;
            }
            run_spill(config, keys, repeat, limit)
        }
        Commands::Config { common } => print_config(&build_config(&common)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct RunOptions {
    common: CommonArgs,
    plan: Option<PathBuf>,
    drivers: usize,
    batches: usize,
    rows: usize,
    repeat: usize,
    predicate: String,
    cancel_after_rows: Option<u64>,
    pause_ms: Option<u64>,
}

fn build_config(common: &CommonArgs) -> ExecConfig {
    let mut config = ExecConfig::from_env();
    apply_overrides(&mut config, common);
    config
}

fn apply_overrides(config: &mut ExecConfig, common: &CommonArgs) {
    if let Some(cap) = common.memory_cap {
        config.mem_cap_bytes = cap;
    }
    if let Some(threads) = common.threads {
        config.executor_threads = threads;
    }
    if let Some(ms) = common.time_slice_ms {
        config.driver_cpu_time_slice_limit_ms = ms;
    }
}

/// `batches` batches of `rows` rows with a running counter in `c0` and its
/// square in `c1`.
fn demo_batches(batches: usize, rows: usize) -> Vec<RowBatch> {
    (0..batches)
        .map(|b| {
            let base = (b * rows) as i64;
            let c0: Vec<Scalar> = (0..rows as i64).map(|i| Scalar::I64(base + i)).collect();
            let c1: Vec<Scalar> = (0..rows as i64)
                .map(|i| Scalar::I64((base + i) * (base + i)))
                .collect();
            RowBatch::new(vec![Column::new("c0", c0), Column::new("c1", c1)])
        })
        .collect()
}

fn counting_consumer(rows: &Arc<AtomicU64>) -> BatchConsumer {
    let rows = Arc::clone(rows);
    Arc::new(move |batch: RowBatch| {
        rows.fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        None
    })
}

fn run_pipeline(opts: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&opts.common);
    let plan = match &opts.plan {
        Some(path) => PlanNode::from_json(&fs::read_to_string(path)?)?,
        None => PlanBuilder::new()
            .values_repeated(demo_batches(opts.batches, opts.rows), true, opts.repeat)
            .filter(opts.predicate.as_str())
            .plan_node()?,
    };

    let ctx = QueryCtx::new(config)?;
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("cli.run", plan, ctx, Some(counting_consumer(&rows)))?;
    let started = Instant::now();
    task.start(opts.drivers)?;

    if let Some(ms) = opts.pause_ms {
        task.request_pause().wait();
        info!(rows = rows.load(Ordering::Relaxed), "task paused");
        std::thread::sleep(Duration::from_millis(ms));
        task.resume();
        info!("task resumed");
    }

    let completion = task.task_completion_future();
    if let Some(limit) = opts.cancel_after_rows {
        while !completion.wait_for(Duration::from_millis(1)) {
            if rows.load(Ordering::Relaxed) >= limit {
                info!(rows = rows.load(Ordering::Relaxed), "cancelling task");
                task.request_cancel().wait();
                break;
            }
        }
    }
    completion.wait();

    let stats = task.task_stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "{} in {}ms: {} rows",
        task.state(),
        started.elapsed().as_millis(),
        rows.load(Ordering::Relaxed)
    );
    match (task.state(), task.error()) {
        (TaskState::Finished, _) | (TaskState::Canceled, _) => Ok(()),
        (_, Some(e)) => Err(e.into()),
        (state, None) => Err(format!("task ended in state {state}").into()),
    }
}

fn run_spill(
    config: ExecConfig,
    keys: usize,
    repeat: usize,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let batch_rows = 10_000usize;
    let batches: Vec<RowBatch> = (0..keys)
        .step_by(batch_rows)
        .map(|start| {
            let end = (start + batch_rows).min(keys);
            let keys: Vec<Scalar> = (start as i64..end as i64).map(Scalar::I64).collect();
            RowBatch::new(vec![Column::new("k", keys)])
        })
        .collect();
    let plan = PlanBuilder::new()
        .values_repeated(batches, false, repeat)
        .row_number(vec!["k".to_string()], limit, true)
        .plan_node()?;

    let ctx = QueryCtx::new(config)?;
    let rows = Arc::new(AtomicU64::new(0));
    let task = Task::create("cli.spill", plan, Arc::clone(&ctx), Some(counting_consumer(&rows)))?;
    task.start(1)?;
    task.task_completion_future().wait();

    if let Some(e) = task.error() {
        return Err(e.into());
    }
    let stats = task.task_stats();
    println!("rows: {}", rows.load(Ordering::Relaxed));
    println!("spill: {}", stats.spill_stats());
    println!(
        "arbitrator: {}",
        serde_json::to_string_pretty(&ctx.arbitrator().stats())?
    );
    Ok(())
}

fn print_config(config: &ExecConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_over_env_defaults() {
        let mut config = ExecConfig::default();
        let common = CommonArgs {
            memory_cap: Some(1 << 20),
            threads: Some(2),
            time_slice_ms: None,
        };
        apply_overrides(&mut config, &common);
        assert_eq!(config.mem_cap_bytes, 1 << 20);
        assert_eq!(config.executor_threads, 2);
        assert_eq!(config.driver_cpu_time_slice_limit_ms, 0);
    }

    #[test]
    fn demo_batches_number_rows_consecutively() {
        let batches = demo_batches(3, 4);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].num_rows(), 4);
        let c0 = batches[2].column("c0").unwrap();
        assert_eq!(c0.values[0], Scalar::I64(8));
        let c1 = batches[2].column("c1").unwrap();
        assert_eq!(c1.values[1], Scalar::I64(81));
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "strata",
            "run",
            "--drivers",
            "2",
            "--cancel-after-rows",
            "100",
            "--memory-cap",
            "4096",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                drivers,
                cancel_after_rows,
                common,
                ..
            } => {
                assert_eq!(drivers, 2);
                assert_eq!(cancel_after_rows, Some(100));
                assert_eq!(common.memory_cap, Some(4096));
            }
            _ => panic!("expected run"),
        }
    }
}
