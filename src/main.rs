//! TreeCache CLI
//!
//! Builds a cache from a YAML configuration plus command-line overrides and
//! either prints the assembled interceptor chain or runs a concurrent mixed
//! workload against it.
//!
//! ```text
//! treecache --config cache.yaml chain
//! treecache --locking pessimistic --threads 8 --operations 50000 bench
//! ```
//!
//! Clustered configurations start `--members` caches joined through an
//! in-process transport; the workload runs on the first one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use treecache::adapters::{InMemoryCacheLoader, InMemoryCluster, LoggingListener};
use treecache::{CacheBuilder, CacheConfig, Fqn, IsolationLevel, NodeLockingScheme, TreeCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TreeCache - transactional tree-structured cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TREECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Node locking scheme
    #[arg(long, env = "TREECACHE_LOCKING", value_enum)]
    locking: Option<Locking>,

    /// Transaction isolation level
    #[arg(long, env = "TREECACHE_ISOLATION", value_enum)]
    isolation: Option<Isolation>,

    /// Lock acquisition timeout in milliseconds
    #[arg(long, env = "TREECACHE_LOCK_TIMEOUT_MS")]
    lock_timeout_ms: Option<u64>,

    /// Worker threads for the benchmark
    #[arg(long, env = "TREECACHE_THREADS", default_value = "4")]
    threads: usize,

    /// Operations per worker thread
    #[arg(long, env = "TREECACHE_OPERATIONS", default_value = "10000")]
    operations: usize,

    /// Cluster members started for clustered cache modes
    #[arg(long, env = "TREECACHE_MEMBERS", default_value = "2")]
    members: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Print the assembled interceptor chain
    Chain,
    /// Run a concurrent mixed workload and print statistics
    Bench,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Locking {
    Mvcc,
    Pessimistic,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Isolation {
    None,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<Isolation> for IsolationLevel {
    fn from(isolation: Isolation) -> Self {
        match isolation {
            Isolation::None => IsolationLevel::None,
            Isolation::ReadUncommitted => IsolationLevel::ReadUncommitted,
            Isolation::ReadCommitted => IsolationLevel::ReadCommitted,
            Isolation::RepeatableRead => IsolationLevel::RepeatableRead,
            Isolation::Serializable => IsolationLevel::Serializable,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting TreeCache");
    info!("  Locking: {}", config.locking_scheme());
    info!("  Isolation: {}", config.isolation());
    info!("  Cache mode: {:?}", config.cache_mode);
    info!("  Lock timeout: {:?}", config.lock_acquisition_timeout);

    let caches = build_caches(&config, args.members)?;
    let Some(cache) = caches.first().cloned() else {
        anyhow::bail!("no cache was built");
    };

    match args.command.unwrap_or(Command::Chain) {
        Command::Chain => {
            println!("{}", cache.interceptor_chain());
        }
        Command::Bench => {
            for member in &caches {
                member.start().context("cache failed to start")?;
            }
            run_bench(&cache, args.threads, args.operations)?;
            for member in caches.iter().rev() {
                member.stop()?;
            }
        }
    }

    info!("TreeCache shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(locking) = args.locking {
        config.node_locking_scheme = match locking {
            Locking::Mvcc => NodeLockingScheme::Mvcc,
            Locking::Pessimistic => NodeLockingScheme::Pessimistic,
        };
    }
    if let Some(isolation) = args.isolation {
        config.isolation_level = isolation.into();
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_acquisition_timeout = Duration::from_millis(ms);
    }
    config.validate()?;
    Ok(config)
}

fn build_caches(config: &CacheConfig, members: usize) -> anyhow::Result<Vec<TreeCache>> {
    let count = if config.cache_mode.is_clustered() { members.max(1) } else { 1 };
    let cluster = InMemoryCluster::new();

    let mut caches = Vec::with_capacity(count);
    for _ in 0..count {
        let mut builder = CacheBuilder::new(config.clone());
        if config.cache_mode.is_clustered() {
            builder = builder.with_transport(cluster.join());
        }
        if config.loader.is_some() {
            builder = builder.with_loader(Arc::new(InMemoryCacheLoader::new()));
        }
        let cache = builder.build()?;
        cache
            .notifier()
            .add_listener_for_all(Arc::new(LoggingListener::debug_level().post_only()));
        caches.push(cache);
    }
    Ok(caches)
}

// =============================================================================
// Benchmark
// =============================================================================

/// Per-thread mix: reads, writes, key removals and small transactions
fn run_bench(cache: &TreeCache, threads: usize, operations: usize) -> anyhow::Result<()> {
    let failures = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..threads.max(1))
        .map(|worker| {
            let cache = cache.clone();
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                for i in 0..operations {
                    if let Err(e) = bench_step(&cache, worker, i) {
                        failures.fetch_add(1, Ordering::Relaxed);
                        if e.is_lock_timeout() {
                            continue;
                        }
                        warn!(worker, step = i, error = %e, "operation failed");
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("benchmark worker panicked");
        }
    }

    let elapsed = started.elapsed();
    let total = (threads.max(1) * operations) as f64;
    let summary = json!({
        "threads": threads,
        "operations": total,
        "elapsed_ms": elapsed.as_millis() as u64,
        "ops_per_second": total / elapsed.as_secs_f64().max(f64::EPSILON),
        "failures": failures.load(Ordering::Relaxed),
        "nodes": cache.number_of_nodes(),
        "locks_held": cache.number_of_locks_held(),
        "statistics": cache.statistics(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Ok(metrics) = cache.render_metrics() {
        println!("{}", metrics);
    }
    Ok(())
}

fn bench_step(cache: &TreeCache, worker: usize, i: usize) -> treecache::Result<()> {
    let own = Fqn::from_elements(["bench".to_string(), worker.to_string(), (i % 100).to_string()]);
    let shared = Fqn::from_elements(["shared".to_string(), (i % 10).to_string()]);

    match i % 10 {
        0..=5 => {
            cache.get(&own, "value")?;
            cache.get(&shared, "value")?;
        }
        6 | 7 => {
            cache.put(&own, "value", json!(i))?;
        }
        8 => {
            cache.remove(&own, "value")?;
        }
        _ => {
            let tm = cache.transaction_manager();
            tm.begin()?;
            let result = cache
                .put(&shared, "value", json!(i))
                .and_then(|_| cache.put(&own, "last_tx", json!(i)));
            match result {
                Ok(_) => tm.commit()?,
                Err(e) => {
                    tm.rollback()?;
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
