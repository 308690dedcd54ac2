//! Prometheus text exposition of cache statistics
//!
//! Counters are copied from a [`StatsSnapshot`] into a private
//! [`prometheus::Registry`], so several caches can be exported side by side
//! without touching the global registry.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::{MappingCache, StatsSnapshot};
use crate::error::{Error, Result};

/// Prefix of every exported metric
pub const METRIC_PREFIX: &str = "mapcache";

/// Encode a snapshot plus the current occupancy in the text format.
pub fn encode_snapshot(
    snapshot: &StatsSnapshot,
    buffers: usize,
    mappings: usize,
) -> Result<String> {
    let registry = Registry::new();

    for (name, help, value) in snapshot.counters() {
        let opts = Opts::new(format!("{name}_total"), help).namespace(METRIC_PREFIX);
        let counter = IntCounter::with_opts(opts)?;
        counter.inc_by(value);
        registry.register(Box::new(counter))?;
    }

    let hit_ratio = Gauge::with_opts(
        Opts::new("hit_ratio", "Fraction of map requests served from cache")
            .namespace(METRIC_PREFIX),
    )?;
    hit_ratio.set(snapshot.hit_ratio);
    registry.register(Box::new(hit_ratio))?;

    for (name, help, value) in [
        ("buffers", "Buffers currently cached", buffers),
        ("mappings", "Mappings currently cached", mappings),
    ] {
        let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(METRIC_PREFIX))?;
        gauge.set(value as i64);
        registry.register(Box::new(gauge))?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| Error::Internal(format!("metrics are not utf-8: {}", e)))
}

/// Encode the live statistics of `cache`.
pub fn encode(cache: &MappingCache) -> Result<String> {
    encode_snapshot(
        &cache.stats_snapshot(),
        cache.buffer_count(),
        cache.mapping_count(),
    )
}
