use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regiongc::{AllocError, GcStatsSnapshot, Heap, Mutator, PauseRecord};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing_subscriber::filter::EnvFilter;

mod config;

use config::{Config, WorkloadConfig};

#[derive(Parser)]
#[command(name = "regiongc", version, about = "Allocation workload driver for the regiongc collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic allocation workload
    Run {
        /// TOML file with [gc] and [workload] tables
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the number of mutator threads
        #[arg(long)]
        threads: Option<usize>,
        /// Override the allocations per thread
        #[arg(long)]
        allocations: Option<u64>,
        /// Verify the heap after every pause
        #[arg(long)]
        verify: bool,
        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default configuration as TOML
    DefaultConfig,
}

#[derive(Serialize)]
struct Report {
    elapsed_ms: f64,
    allocated_objects: u64,
    stats: GcStatsSnapshot,
    pauses: Vec<PauseRecord>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            threads,
            allocations,
            verify,
            json,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(threads) = threads {
                config.workload.threads = threads;
            }
            if let Some(allocations) = allocations {
                config.workload.allocations = allocations;
            }
            if verify {
                config.gc.verify_after_gc = true;
            }
            run_workload(config, json)?
        }
        Commands::DefaultConfig => print!("{}", toml::to_string_pretty(&Config::default())?),
    }

    Ok(())
}

fn run_workload(config: Config, json: bool) -> Result<()> {
    let heap = Heap::with_config(config.gc)?;
    let workload = config.workload;
    tracing::info!(
        threads = workload.threads,
        allocations = workload.allocations,
        live_objects = workload.live_objects,
        "starting workload"
    );
    let start = Instant::now();

    let handles: Vec<_> = (0..workload.threads)
        .map(|id| {
            let heap = Arc::clone(&heap);
            let workload = workload.clone();
            thread::Builder::new()
                .name(format!("mutator-{id}"))
                .spawn(move || {
                    let m = heap.attach_mutator();
                    mutate(&m, &workload, id as u64)
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut allocated = 0;
    let mut failure = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(count)) => allocated += count,
            Ok(Err(err)) => failure = Some(err),
            Err(_) => anyhow::bail!("mutator thread panicked"),
        }
    }
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    heap.verify_at_safepoint().context("final heap verification")?;
    let report = Report {
        elapsed_ms,
        allocated_objects: allocated,
        stats: heap.stats().snapshot(),
        pauses: heap.stats().history(),
    };
    heap.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Keep a window of live objects reachable from a rooted array while
/// allocating garbage around it
fn mutate(m: &Mutator, workload: &WorkloadConfig, thread_id: u64) -> Result<u64, AllocError> {
    let mut seed = 0x2545_f491_4f6c_dd1d ^ (thread_id + 1);
    let live = m.root(m.allocate_obj_array(workload.live_objects.max(1))?);
    let mut allocated = 1;
    for i in 1..=workload.allocations {
        let r = next_random(&mut seed);
        let obj = m.allocate_instance(1, 1)?;
        m.write_word(obj, 0, i);
        let slot = (r as usize) % workload.live_objects.max(1);
        m.write_ref(obj, 0, m.read_ref(live.get(), slot));
        m.write_ref(live.get(), slot, obj);

        if workload.max_array_words > 0 {
            m.allocate_type_array((r >> 32) as usize % workload.max_array_words)?;
            allocated += 1;
        }
        if workload.humongous_every > 0 && i % workload.humongous_every == 0 {
            let words = m.heap().geometry().region_words + (r as usize % 1024);
            m.allocate_type_array(words)?;
            allocated += 1;
        }
        if workload.collect_every > 0 && i % workload.collect_every == 0 {
            m.collect();
        }
        allocated += 1;
    }
    Ok(allocated)
}

fn next_random(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn print_report(report: &Report) {
    let stats = &report.stats;
    println!("elapsed:              {:.1} ms", report.elapsed_ms);
    println!("objects allocated:    {}", report.allocated_objects);
    println!("pauses:               {}", stats.collections);
    println!("total pause:          {:.2} ms", stats.total_pause_ms);
    println!("max pause:            {:.2} ms", stats.max_pause_ms);
    println!("copied:               {} KB", stats.copied_bytes / 1024);
    println!("promoted:             {} KB", stats.promoted_bytes / 1024);
    println!("evacuation failures:  {}", stats.evacuation_failures);
    println!("concurrent starts:    {}", stats.concurrent_starts);
    println!(
        "humongous:            {} allocated, {} reclaimed",
        stats.humongous_allocated, stats.humongous_reclaimed
    );
    println!("regions uncommitted:  {}", stats.regions_uncommitted);
    if let Some(last) = report.pauses.last() {
        println!(
            "last pause:           #{} {} {:.2} ms, {} KB -> {} KB",
            last.id,
            last.cause,
            last.duration_ms,
            last.used_before / 1024,
            last.used_after / 1024
        );
    }
}
