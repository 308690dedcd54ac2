//! Mapping Cache Stress Driver
//!
//! Hammers a [`MappingCache`] backed by the mock platform from many worker
//! threads, then tears everything down and verifies that no mapping leaked.
//!
//! # Phases
//!
//! ```text
//! ┌────────────┐    ┌──────────────────┐    ┌────────────┐    ┌──────────┐
//! │  Workers   │───▶│  Buffer frees    │───▶│  Device    │───▶│ Teardown │
//! │ map/unmap  │    │ (every 4th buf)  │    │  sweeps    │    │ + verify │
//! └────────────┘    └──────────────────┘    └────────────┘    └──────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iommu_mapcache::error::{Error, Result};
use iommu_mapcache::mock::MockPlatform;
use iommu_mapcache::{
    metrics, BufferId, CacheConfig, DeviceId, DmaDirection, MapAttrs, MappingCache, Segment,
    StatsSnapshot,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable summary in the log
    Text,
    /// JSON report on stdout
    Json,
    /// Prometheus text exposition on stdout
    Prometheus,
}

/// Mapping cache stress driver - concurrent map/unmap against a mock platform
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker threads
    #[arg(long, env = "MAPCACHE_THREADS", default_value = "8")]
    threads: usize,

    /// Distinct buffers shared by the workers
    #[arg(long, env = "MAPCACHE_BUFFERS", default_value = "64")]
    buffers: u64,

    /// Distinct devices
    #[arg(long, env = "MAPCACHE_DEVICES", default_value = "4")]
    devices: u32,

    /// Map requests per worker
    #[arg(long, env = "MAPCACHE_ITERATIONS", default_value = "10000")]
    iterations: usize,

    /// Every n-th map requests eager reclaim (0 disables)
    #[arg(long, env = "MAPCACHE_EAGER_EVERY", default_value = "5")]
    eager_every: usize,

    /// Every n-th map is left referenced for the device sweeps (0 disables)
    #[arg(long, env = "MAPCACHE_HOLD_EVERY", default_value = "16")]
    hold_every: usize,

    /// Make every n-th platform map attempt fail (0 disables)
    #[arg(long, env = "MAPCACHE_FAIL_EVERY", default_value = "0")]
    fail_every: u64,

    /// Latency of each platform map call in microseconds
    #[arg(long, env = "MAPCACHE_MAP_LATENCY_US", default_value = "0")]
    map_latency_us: u64,

    /// Devices that need a barrier on mapping reuse
    #[arg(long, env = "MAPCACHE_BARRIER_DEVICES", value_delimiter = ',')]
    barrier_devices: Vec<u32>,

    /// Cache configuration file (YAML, or JSON with a .json extension)
    #[arg(long, env = "MAPCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    threads: usize,
    iterations: usize,
    elapsed_ms: u128,
    maps_per_sec: f64,
    failed_requests: u64,
    sweep_passes: usize,
    stats: StatsSnapshot,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    if args.threads == 0 || args.buffers == 0 || args.devices == 0 {
        return Err(Error::Config(
            "threads, buffers and devices must all be > 0".into(),
        ));
    }

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };

    info!("Starting mapping cache stress run");
    info!("  Threads: {}", args.threads);
    info!("  Buffers: {}, devices: {}", args.buffers, args.devices);
    info!("  Iterations per worker: {}", args.iterations);

    let platform = Arc::new(MockPlatform::new());
    platform.fail_every(args.fail_every);
    platform.set_map_latency(Duration::from_micros(args.map_latency_us));
    for device in &args.barrier_devices {
        platform.set_requires_barrier(DeviceId(*device), true);
    }

    let cache = Arc::new(MappingCache::with_config(config, platform.clone())?);

    let started = Instant::now();
    let failed_requests = run_workers(&args, &cache).await?;
    let elapsed = started.elapsed();

    // Destroy a share of the buffers while mappings are still held
    for buffer in (0..args.buffers).step_by(4) {
        cache.buffer_freed(BufferId(buffer));
    }

    let sweep_passes = sweep_devices(&cache, args.devices);
    let retired = cache.teardown();
    debug!(retired, "teardown complete");

    verify(&cache, &platform)?;

    let stats = cache.stats_snapshot();
    let report = Report {
        threads: args.threads,
        iterations: args.iterations,
        elapsed_ms: elapsed.as_millis(),
        maps_per_sec: stats.map_calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        failed_requests,
        sweep_passes,
        stats,
    };

    match args.output {
        OutputFormat::Text => {
            info!("Stress run complete in {:?}", elapsed);
            info!(
                "  Map requests: {} ({:.0}/s)",
                report.stats.map_calls, report.maps_per_sec
            );
            info!("  Hit ratio: {:.3}", report.stats.hit_ratio);
            info!("  Platform maps: {}", report.stats.platform_maps);
            info!("  Creation races: {}", report.stats.creation_races);
            info!("  Forced detaches: {}", report.stats.forced_detaches);
            info!("  Sweep passes: {}", report.sweep_passes);
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Prometheus => print!("{}", metrics::encode(&cache)?),
    }

    Ok(())
}

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

    // Logs go to stderr; stdout carries the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Phases
// =============================================================================

/// Run every worker on the blocking pool. Returns the number of map requests
/// that failed.
async fn run_workers(args: &Args, cache: &Arc<MappingCache>) -> Result<u64> {
    let handles: Vec<_> = (0..args.threads)
        .map(|worker| {
            let cache = Arc::clone(cache);
            let plan = WorkerPlan {
                worker,
                buffers: args.buffers,
                devices: args.devices,
                iterations: args.iterations,
                eager_every: args.eager_every,
                hold_every: args.hold_every,
            };
            tokio::task::spawn_blocking(move || plan.run(&cache))
        })
        .collect();

    let mut failed = 0;
    for handle in handles {
        failed += handle
            .await
            .map_err(|e| Error::Internal(format!("worker panicked: {}", e)))?;
    }
    Ok(failed)
}

/// Sweep every device until nothing referenced is left. Returns the passes
/// needed.
fn sweep_devices(cache: &MappingCache, devices: u32) -> usize {
    let mut passes = 0;
    loop {
        passes += 1;
        let mut clean = true;
        for device in 0..devices {
            if let Err(e) = cache.unmap_all_for_device(DeviceId(device)) {
                debug!(%e, "sweep pass {} incomplete", passes);
                clean = false;
            }
        }
        if clean {
            return passes;
        }
    }
}

fn verify(cache: &MappingCache, platform: &MockPlatform) -> Result<()> {
    if cache.buffer_count() != 0 {
        return Err(Error::Internal(format!(
            "{} buffer(s) still cached after teardown",
            cache.buffer_count()
        )));
    }
    if platform.live_mappings() != 0 {
        return Err(Error::Internal(format!(
            "{} platform mapping(s) leaked",
            platform.live_mappings()
        )));
    }
    if platform.double_unmaps() != 0 {
        return Err(Error::Internal(format!(
            "{} mapping(s) unmapped twice",
            platform.double_unmaps()
        )));
    }
    info!("Verified: no leaked or doubly unmapped mappings");
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

struct WorkerPlan {
    worker: usize,
    buffers: u64,
    devices: u32,
    iterations: usize,
    eager_every: usize,
    hold_every: usize,
}

impl WorkerPlan {
    fn run(self, cache: &MappingCache) -> u64 {
        let mut failed = 0;
        let stride = 2 * self.worker as u64 + 1;

        for i in 0..self.iterations {
            let slot = (self.worker as u64 * 7919 + i as u64 * stride) % self.buffers;
            let buffer = BufferId(slot);
            let device = DeviceId(((self.worker + i) as u32) % self.devices);
            let eager = self.eager_every != 0 && i % self.eager_every == 0;
            let attrs = if eager {
                MapAttrs::eager()
            } else {
                MapAttrs::deferred()
            };

            let nents = 1 + (buffer.raw() % 4) as usize;
            let mut segments: Vec<Segment> = (0..nents)
                .map(|n| Segment::new(buffer.raw() * 16 + n as u64, 0, 4096))
                .collect();

            let direction = DmaDirection::Bidirectional;
            let outcome = match cache.map(device, &mut segments, direction, buffer, attrs) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(worker = self.worker, %e, "map request failed");
                    failed += 1;
                    continue;
                }
            };

            if self.hold_every != 0 && i % self.hold_every == 0 {
                continue;
            }

            // A freshly created eager mapping carries one extra reference
            let releases = if eager && !outcome.cache_hit { 2 } else { 1 };
            for _ in 0..releases {
                cache.unmap(device, buffer);
            }
        }
        failed
    }
}
