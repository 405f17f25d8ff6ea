use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use parfold::io::{create_progress_bar, parse_values, read_values, ProgressObserver};
use parfold::{ReduceConfig, ReduceEngine};

/// Summed when no values are given.
const DEMO_INPUT: [i64; 8] = [4, 1, 6, 2, 9, 5, 10, 3];

#[derive(Parser, Debug)]
#[command(name = "parfold")]
#[command(about = "Sum integers in parallel with per-worker local accumulators", long_about = None)]
struct Args {
    /// Integers to sum, or "-" to read them from stdin (defaults to a demo input)
    #[arg(value_name = "VALUES", allow_negative_numbers = true)]
    values: Vec<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'j', long, env = "PARFOLD_THREADS")]
    threads: Option<usize>,

    /// Items per partition (defaults to an even split across workers)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Upper bound of the simulated per-item latency in milliseconds
    #[arg(long, default_value_t = 0)]
    max_delay_ms: u64,

    /// Disable progress bar
    #[arg(short, long)]
    quiet: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let values = match args.values.as_slice() {
        [] => DEMO_INPUT.to_vec(),
        [dash] if dash == "-" => read_values(std::io::stdin().lock())?,
        values => parse_values(&values.join(" "))?,
    };

    let mut config = ReduceConfig::new();
    config.workers = args.threads;
    config.chunk_size = args.chunk_size;
    let mut engine = ReduceEngine::new(config);

    let progress = if !args.quiet && !values.is_empty() {
        Some(create_progress_bar(values.len())?)
    } else {
        None
    };
    if let Some(ref pb) = progress {
        engine = engine.with_observer(ProgressObserver::new(pb.clone()));
    }

    println!(
        "Summing {} values using {} worker threads",
        values.len(),
        engine.num_workers()
    );

    let max_delay_ms = args.max_delay_ms;
    let reduction = engine
        .reduce(
            0i64,
            &values,
            || Ok(0i64),
            |&n, local: i64| {
                thread::sleep(simulated_latency(n, max_delay_ms));
                local
                    .checked_add(n)
                    .with_context(|| format!("local sum overflowed adding {n}"))
            },
            |total, local| {
                match total.checked_add(local) {
                    Some(sum) => *total = sum,
                    None => bail!("total overflowed adding {local}"),
                }
                Ok(())
            },
        )
        .context("Parallel sum failed");

    if let Some(ref pb) = progress {
        match reduction {
            Ok(_) => pb.finish_with_message("Sum complete"),
            Err(_) => pb.abandon(),
        }
    }
    let reduction = reduction?;

    for fault in &reduction.diagnostics_faults {
        eprintln!("warning: {fault}");
    }

    if !args.quiet {
        for stats in &reduction.partition_stats {
            let local_sum: i64 = values[stats.range.clone()].iter().sum();
            println!(
                "Partition={}, items={}, localSum={}, elapsed={:.2?}",
                stats.id,
                stats.items(),
                local_sum,
                stats.elapsed
            );
        }
    }

    println!(
        "\nSum={} ({} items, {} partitions, {:.2?})",
        reduction.value, reduction.items_folded, reduction.partitions, reduction.elapsed
    );

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "parfold=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Deterministic stand-in for real work: the same value always sleeps the
/// same amount, somewhere in `[0, max_ms)`.
fn simulated_latency(value: i64, max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mixed = (value as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_millis((mixed >> 32) % max_ms)
}
