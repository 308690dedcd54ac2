//! Cache statistics
//!
//! Lock-free counters updated on the hot paths, plus a serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Statistics for the mapping cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Total map requests
    pub map_calls: AtomicU64,
    /// Map requests served from a cached mapping
    pub cache_hits: AtomicU64,
    /// Map requests that created a mapping
    pub cache_misses: AtomicU64,
    /// Memory barriers issued on reuse
    pub barriers: AtomicU64,
    /// Calls into the platform map primitive that succeeded
    pub platform_maps: AtomicU64,
    /// Calls into the platform unmap primitive
    pub platform_unmaps: AtomicU64,
    /// Failed allocation attempts that were retried
    pub alloc_retries: AtomicU64,
    /// Failed platform map attempts that were retried
    pub map_retries: AtomicU64,
    /// Map requests that failed because a bounded retry policy gave up
    pub map_failures: AtomicU64,
    /// Fresh mappings discarded because a racing caller attached one first
    pub creation_races: AtomicU64,
    /// Map requests restarted because the buffer was destroyed meanwhile
    pub retired_restarts: AtomicU64,
    /// Total unmap requests
    pub unmap_calls: AtomicU64,
    /// Unmap requests for an unknown buffer/device pair
    pub unmap_noops: AtomicU64,
    /// Buffer entries created
    pub buffers_created: AtomicU64,
    /// Buffer entries removed from the index
    pub buffers_retired: AtomicU64,
    /// Mapping entries created
    pub mappings_created: AtomicU64,
    /// Mapping entries destroyed
    pub mappings_destroyed: AtomicU64,
    /// Device sweeps performed
    pub device_sweeps: AtomicU64,
    /// Mappings left referenced by a device sweep
    pub sweep_residuals: AtomicU64,
    /// Buffer destruction notifications handled
    pub buffers_freed: AtomicU64,
    /// Mappings torn down by buffer destruction while still referenced
    pub forced_detaches: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Record a map request served from cache.
    pub fn record_hit(&self, barrier: bool) {
        Self::bump(&self.map_calls);
        Self::bump(&self.cache_hits);
        if barrier {
            Self::bump(&self.barriers);
        }
    }

    /// Record a map request that created a new mapping.
    pub fn record_miss(&self) {
        Self::bump(&self.map_calls);
        Self::bump(&self.cache_misses);
        Self::bump(&self.mappings_created);
    }

    /// Record retries spent inside a map request.
    pub fn record_retries(&self, alloc: u32, map: u32) {
        Self::add(&self.alloc_retries, alloc as u64);
        Self::add(&self.map_retries, map as u64);
    }

    /// Hit ratio over all map requests.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let total = self.map_calls.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Take a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            map_calls: load(&self.map_calls),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            barriers: load(&self.barriers),
            platform_maps: load(&self.platform_maps),
            platform_unmaps: load(&self.platform_unmaps),
            alloc_retries: load(&self.alloc_retries),
            map_retries: load(&self.map_retries),
            map_failures: load(&self.map_failures),
            creation_races: load(&self.creation_races),
            retired_restarts: load(&self.retired_restarts),
            unmap_calls: load(&self.unmap_calls),
            unmap_noops: load(&self.unmap_noops),
            buffers_created: load(&self.buffers_created),
            buffers_retired: load(&self.buffers_retired),
            mappings_created: load(&self.mappings_created),
            mappings_destroyed: load(&self.mappings_destroyed),
            device_sweeps: load(&self.device_sweeps),
            sweep_residuals: load(&self.sweep_residuals),
            buffers_freed: load(&self.buffers_freed),
            forced_detaches: load(&self.forced_detaches),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub map_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub barriers: u64,
    pub platform_maps: u64,
    pub platform_unmaps: u64,
    pub alloc_retries: u64,
    pub map_retries: u64,
    pub map_failures: u64,
    pub creation_races: u64,
    pub retired_restarts: u64,
    pub unmap_calls: u64,
    pub unmap_noops: u64,
    pub buffers_created: u64,
    pub buffers_retired: u64,
    pub mappings_created: u64,
    pub mappings_destroyed: u64,
    pub device_sweeps: u64,
    pub sweep_residuals: u64,
    pub buffers_freed: u64,
    pub forced_detaches: u64,
    pub hit_ratio: f64,
}

impl StatsSnapshot {
    /// Counter name, help text and value, for exporters.
    pub fn counters(&self) -> Vec<(&'static str, &'static str, u64)> {
        vec![
            ("map_calls", "Total map requests", self.map_calls),
            ("cache_hits", "Map requests served from cache", self.cache_hits),
            ("cache_misses", "Map requests that created a mapping", self.cache_misses),
            ("barriers", "Memory barriers issued on reuse", self.barriers),
            ("platform_maps", "Successful platform map calls", self.platform_maps),
            ("platform_unmaps", "Platform unmap calls", self.platform_unmaps),
            ("alloc_retries", "Retried record allocations", self.alloc_retries),
            ("map_retries", "Retried platform map calls", self.map_retries),
            ("map_failures", "Map requests that gave up", self.map_failures),
            ("creation_races", "Fresh mappings discarded after a race", self.creation_races),
            (
                "retired_restarts",
                "Map requests restarted after buffer destruction",
                self.retired_restarts,
            ),
            ("unmap_calls", "Total unmap requests", self.unmap_calls),
            ("unmap_noops", "Unmap requests with nothing to release", self.unmap_noops),
            ("buffers_created", "Buffer entries created", self.buffers_created),
            ("buffers_retired", "Buffer entries removed from the index", self.buffers_retired),
            ("mappings_created", "Mapping entries created", self.mappings_created),
            ("mappings_destroyed", "Mapping entries destroyed", self.mappings_destroyed),
            ("device_sweeps", "Device-wide unmap sweeps", self.device_sweeps),
            ("sweep_residuals", "Mappings left referenced by a sweep", self.sweep_residuals),
            ("buffers_freed", "Buffer destruction notifications", self.buffers_freed),
            (
                "forced_detaches",
                "Still-referenced mappings torn down on buffer destruction",
                self.forced_detaches,
            ),
        ]
    }
}
