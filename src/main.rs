use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::eyre;
use console::style;

use cachecore::cache::CacheBuilder;
use cachecore::concurrency::{HashBucketLocks, InProcessLineLockManager};
use cachecore::config::CacheConfig;
use cachecore::core_device::CoreDevice;
use cachecore::dispatch::{build_engine_context, Dispatcher};
use cachecore::engine::InMemoryCoreIo;
use cachecore::mode::CacheMode;
use cachecore::parallelize::Parallelizer;
use cachecore::queue::QueueFabric;
use cachecore::request::{Direction, Request};
use cachecore::stats::Stats;
use cachecore::traverse::InProcessTraverseService;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Drives a handful of synthetic requests through the dispatch core and
/// prints the resulting stats. Not a benchmark: a sanity-check harness
/// for the request-dispatch/pass-through pipeline.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Options {
    /// Number of dispatch queues in the fabric.
    #[arg(long = "queues", default_value_t = 4)]
    queues: usize,

    /// Cache-line capacity backing the resolver's overflow rule.
    #[arg(long = "cachelines", default_value_t = 1024)]
    cachelines: u32,

    /// Default cache mode for partitions with no explicit mapping.
    #[arg(long = "default-mode", default_value = "wt")]
    default_mode: String,

    /// Number of synthetic requests to dispatch.
    #[arg(long = "requests", default_value_t = 16)]
    requests: u32,

    /// Number of shards for the parallelizer demo run.
    #[arg(long = "shards", default_value_t = 4)]
    shards: u32,
}

fn parse_mode(name: &str) -> eyre::Result<CacheMode> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "wt" => CacheMode::Wt,
        "wb" => CacheMode::Wb,
        "wa" => CacheMode::Wa,
        "wi" => CacheMode::Wi,
        "wo" => CacheMode::Wo,
        "pt" => CacheMode::Pt,
        "fast" => CacheMode::Fast,
        other => eyre::bail!("unknown cache mode {other:?}"),
    })
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    cachecore::init_logging();

    let start = Instant::now();
    let options = Options::parse();
    let default_mode = parse_mode(&options.default_mode)?;

    let config = CacheConfig {
        cachelines: options.cachelines,
        default_cache_mode: default_mode,
        ..CacheConfig::default()
    };
    let cache = Arc::new(CacheBuilder::new(config).build());
    let core = Arc::new(CoreDevice::new(0));

    let stats = Arc::new(Stats::new());
    let engine_ctx = build_engine_context(
        Arc::new(InProcessLineLockManager::new()),
        Arc::new(HashBucketLocks::new()),
        Arc::new(InProcessTraverseService::new()),
        Arc::new(InMemoryCoreIo),
        Arc::clone(&cache),
        Arc::clone(&stats),
    );
    let queues = Arc::new(QueueFabric::new(options.queues));
    let dispatcher = Dispatcher::new(Arc::clone(&engine_ctx), Arc::clone(&queues));

    log::info!(
        "{} {} queues, {} cachelines, default mode {:?}",
        style("dispatching").green(),
        options.queues,
        options.cachelines,
        default_mode
    );

    let completed = Arc::new(AtomicUsize::new(0));
    let outstanding = Arc::new((Mutex::new(()), std::sync::Condvar::new()));

    for i in 0..options.requests {
        let completed = Arc::clone(&completed);
        let rw = if i % 3 == 0 { Direction::Write } else { Direction::Read };
        let req = Request::new(
            u64::from(i) * 4096,
            4096,
            1,
            rw,
            i % 2,
            core.read_errors(),
            Box::new(move |req, status| {
                log::debug!("request {} completed with status {status}", req.id());
                completed.fetch_add(1, Ordering::AcqRel);
            }),
        );
        dispatcher.handle_request(Arc::clone(&core), req, i as usize);
    }

    wait_until(&outstanding, || {
        completed.load(Ordering::Acquire) as u32 >= options.requests
    });

    let parallelizer = Parallelizer::new(Arc::clone(&queues));
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    parallelizer.run(
        options.shards,
        0,
        Arc::new(|shard, shard_total, _priv_area| {
            log::debug!(
                "{}: shard {shard}/{shard_total}",
                style("parallel demo").cyan()
            );
            0
        }),
        Box::new(move |status| done_tx.send(status).unwrap()),
    );
    let shard_status = done_rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap_or(cachecore::error::Error::Invalid.status());

    println!(
        "{}: {} reads, {} writes ({} pass-through reads, {} pass-through writes), \
         {} core errors, {} clean errors, parallel demo status {shard_status}",
        style("stats").bold(),
        stats.total_reads(),
        stats.total_writes(),
        stats.pass_through_reads(),
        stats.pass_through_writes(),
        stats.core_error_count(),
        stats.clean_error_count(),
    );
    log::info!("done in {:?}", start.elapsed());
    Ok(())
}

fn wait_until(pair: &Arc<(Mutex<()>, std::sync::Condvar)>, mut done: impl FnMut() -> bool) {
    let (lock, cvar) = pair.as_ref();
    let mut guard = lock.lock().unwrap();
    while !done() {
        let (next_guard, timeout) = cvar.wait_timeout(guard, Duration::from_millis(5)).unwrap();
        guard = next_guard;
        if timeout.timed_out() && done() {
            break;
        }
    }
}
