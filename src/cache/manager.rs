//! Mapping Cache - public operations
//!
//! Ties the buffer index, the per-buffer mapping sets and the platform
//! primitives together. Lock order is always index, then entry; the platform
//! map and unmap run with no lock held.

use std::mem::size_of;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::{debug, info, instrument, trace, warn};

use super::entry::{BufferEntry, MappingEntry};
use super::index::{BufferIndex, Insertion};
use super::stats::{CacheStats, StatsSnapshot};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::platform::{
    BufferDestroyedListener, HeapAllocator, MappingPlatform, RecordAllocator, RecordKind,
};
use crate::sg::{BufferId, DeviceId, DmaDirection, MapAttrs, Segment};

/// Result of a successful [`MappingCache::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapOutcome {
    /// Element count of the request, returned to signal success
    pub nents: usize,
    /// Served from an existing mapping, without a platform map call
    pub cache_hit: bool,
    /// A memory barrier was issued before returning a reused mapping
    pub barrier: bool,
    /// Failed allocation attempts absorbed by the retry policy
    pub alloc_retries: u32,
    /// Failed platform map attempts absorbed by the retry policy
    pub map_retries: u32,
}

impl MapOutcome {
    /// Total retries spent on this request.
    pub fn retries(&self) -> u32 {
        self.alloc_retries + self.map_retries
    }
}

enum Reuse {
    Hit { barrier: bool },
    Miss,
    Retired,
}

enum Attach {
    Created,
    /// A racing caller attached a mapping for the device first
    Joined { barrier: bool },
    Retired,
}

/// Reference-counted cache of device mappings.
pub struct MappingCache {
    index: BufferIndex,
    platform: Arc<dyn MappingPlatform>,
    allocator: Arc<dyn RecordAllocator>,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl MappingCache {
    /// Create a cache with default configuration
    pub fn new(platform: Arc<dyn MappingPlatform>) -> Self {
        Self {
            index: BufferIndex::new(),
            platform,
            allocator: Arc::new(HeapAllocator),
            config: CacheConfig::default(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Create a cache with custom configuration
    pub fn with_config(config: CacheConfig, platform: Arc<dyn MappingPlatform>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(platform)
        })
    }

    /// Replace the record allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn RecordAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // =========================================================================
    // Map
    // =========================================================================

    /// Map `segments` of `buffer` for `device`, reusing a cached mapping when
    /// one exists.
    ///
    /// On return the segments carry the device addresses. Every successful
    /// call must be balanced by one [`MappingCache::unmap`] (two for the
    /// first map with `eager_reclaim`).
    #[instrument(
        level = "debug",
        skip(self, segments, attrs),
        fields(nents = segments.len())
    )]
    pub fn map(
        &self,
        device: DeviceId,
        segments: &mut [Segment],
        direction: DmaDirection,
        buffer: BufferId,
        attrs: MapAttrs,
    ) -> Result<MapOutcome> {
        let nents = segments.len();
        let mut alloc_retries = 0u32;
        let mut map_retries = 0u32;
        let restart = Backoff::new();

        loop {
            // Holds one buffer reference from here on
            let (entry, created) = match self.index.lookup_get(buffer) {
                Some(entry) => (entry, false),
                None => {
                    let (insertion, retries) = self
                        .create_buffer_entry(buffer)
                        .inspect_err(|_| CacheStats::bump(&self.stats.map_failures))?;
                    alloc_retries += retries;
                    let created = insertion.is_inserted();
                    (insertion.into_entry(), created)
                }
            };

            if !created {
                match self.reuse(&entry, device, segments) {
                    Reuse::Hit { barrier } => {
                        self.stats.record_hit(barrier);
                        self.stats.record_retries(alloc_retries, map_retries);
                        trace!(buffer = %entry.key(), "reused cached mapping");
                        return Ok(MapOutcome {
                            nents,
                            cache_hit: true,
                            barrier,
                            alloc_retries,
                            map_retries,
                        });
                    }
                    Reuse::Retired => {
                        self.restart_after_retire(&entry, &restart);
                        continue;
                    }
                    Reuse::Miss => {}
                }
            }

            match self.attach_new_mapping(&entry, device, segments, direction, &attrs) {
                Ok((attach, a, m)) => {
                    alloc_retries += a;
                    map_retries += m;
                    let (cache_hit, barrier) = match attach {
                        Attach::Created => {
                            self.stats.record_miss();
                            debug!(
                                buffer = %entry.key(),
                                eager = attrs.eager_reclaim,
                                "created mapping"
                            );
                            (false, false)
                        }
                        Attach::Joined { barrier } => {
                            self.stats.record_hit(barrier);
                            (true, barrier)
                        }
                        Attach::Retired => {
                            self.restart_after_retire(&entry, &restart);
                            continue;
                        }
                    };
                    self.stats.record_retries(alloc_retries, map_retries);
                    return Ok(MapOutcome {
                        nents,
                        cache_hit,
                        barrier,
                        alloc_retries,
                        map_retries,
                    });
                }
                Err(e) => {
                    CacheStats::bump(&self.stats.map_failures);
                    self.put_buffer(&entry);
                    return Err(e);
                }
            }
        }
    }

    fn create_buffer_entry(&self, buffer: BufferId) -> Result<(Insertion, u32)> {
        let reserved = self.config.alloc_retry.run("buffer entry allocation", || {
            self.allocator
                .try_reserve(RecordKind::BufferEntry, size_of::<BufferEntry>())
        })?;

        let entry = Arc::new(BufferEntry::new(self.index.next_key(buffer), 1));
        let insertion = self.index.insert(entry);
        if let Insertion::Inserted(entry) = &insertion {
            CacheStats::bump(&self.stats.buffers_created);
            debug!(buffer = %entry.key(), "created buffer entry");
        }
        Ok((insertion, reserved.retries))
    }

    fn reuse(&self, entry: &BufferEntry, device: DeviceId, segments: &mut [Segment]) -> Reuse {
        let state = entry.read();
        if state.is_retired() {
            return Reuse::Retired;
        }
        let Some(mapping) = state.find(device) else {
            return Reuse::Miss;
        };
        mapping.refcount().acquire();
        mapping.copy_into(segments);
        drop(state);

        Reuse::Hit {
            barrier: self.barrier_for(device),
        }
    }

    /// Map through the platform and attach the result. Returns the attach
    /// outcome plus the allocation and map retries spent.
    fn attach_new_mapping(
        &self,
        entry: &BufferEntry,
        device: DeviceId,
        segments: &mut [Segment],
        direction: DmaDirection,
        attrs: &MapAttrs,
    ) -> Result<(Attach, u32, u32)> {
        let reserved = self.config.alloc_retry.run("mapping entry allocation", || {
            self.allocator
                .try_reserve(RecordKind::MappingEntry, size_of::<MappingEntry>())
        })?;
        let mapped = self.config.map_retry.run("platform map", || {
            self.platform.map_sg(device, segments, direction, attrs)
        })?;
        CacheStats::bump(&self.stats.platform_maps);

        let seed = attrs.initial_refcount();
        let mapping = MappingEntry::new(device, entry.key(), segments.to_vec(), direction, seed);
        let retries = (reserved.retries, mapped.retries);

        let mut state = entry.write();
        if state.is_retired() {
            drop(state);
            self.platform_unmap(&mapping);
            return Ok((Attach::Retired, retries.0, retries.1));
        }

        if let Some(existing) = state.find(device) {
            existing.refcount().acquire();
            existing.copy_into(segments);
            drop(state);

            CacheStats::bump(&self.stats.creation_races);
            trace!(buffer = %entry.key(), "lost mapping creation race");
            self.platform_unmap(&mapping);
            let barrier = self.barrier_for(device);
            return Ok((Attach::Joined { barrier }, retries.0, retries.1));
        }

        // The buffer carries at least as many references as its mappings
        entry.refcount().acquire_n(seed - 1);
        state.attach(mapping);
        Ok((Attach::Created, retries.0, retries.1))
    }

    fn restart_after_retire(&self, entry: &Arc<BufferEntry>, restart: &Backoff) {
        CacheStats::bump(&self.stats.retired_restarts);
        trace!(buffer = %entry.key(), "buffer destroyed during map, retrying");
        self.put_buffer(entry);
        restart.snooze();
    }

    fn barrier_for(&self, device: DeviceId) -> bool {
        if self.platform.requires_barrier(device) {
            fence(Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Unmap
    // =========================================================================

    /// Drop one reference on the mapping of `buffer` for `device`.
    ///
    /// Unknown pairs are a no-op. Returns `true` when a reference was
    /// released.
    #[instrument(level = "debug", skip(self))]
    pub fn unmap(&self, device: DeviceId, buffer: BufferId) -> bool {
        CacheStats::bump(&self.stats.unmap_calls);

        let Some(entry) = self.index.lookup(buffer) else {
            CacheStats::bump(&self.stats.unmap_noops);
            return false;
        };

        let detached = {
            let mut state = entry.write();
            let Some(pos) = state.position(device) else {
                CacheStats::bump(&self.stats.unmap_noops);
                return false;
            };
            if state.get(pos).refcount().release() {
                Some(state.detach(pos))
            } else {
                None
            }
        };

        // Do the actual unmapping outside of the lock
        if let Some(mapping) = detached {
            self.destroy_mapping(mapping);
        }

        self.put_buffer(&entry);
        true
    }

    /// Drop one reference on every mapping held by `device`.
    ///
    /// Mappings that reach zero are unmapped. Mappings still referenced after
    /// the decrement stay cached and are reported through
    /// [`Error::MappingsStillReferenced`]; the sweep still processes every
    /// other buffer.
    #[instrument(skip(self))]
    pub fn unmap_all_for_device(&self, device: DeviceId) -> Result<()> {
        CacheStats::bump(&self.stats.device_sweeps);

        let mut unmap_list = Vec::new();
        let mut released = Vec::new();
        let mut remaining = 0usize;

        self.index.for_each(|entry| {
            let mut state = entry.write();
            let Some(pos) = state.position(device) else {
                return;
            };
            released.push(entry.key());
            if state.get(pos).refcount().release() {
                unmap_list.push(state.detach(pos));
            } else {
                remaining += 1;
            }
        });

        for mapping in unmap_list {
            self.destroy_mapping(mapping);
        }

        // Buffer references are dropped only now: erasing needs the index
        // write lock, which the traversal above was holding for read.
        for key in released {
            match self.index.lookup_key(key) {
                Some(entry) => self.put_buffer(&entry),
                None => trace!(buffer = %key, "buffer retired during sweep"),
            }
        }

        if remaining > 0 {
            CacheStats::add(&self.stats.sweep_residuals, remaining as u64);
            warn!(remaining, "device sweep left referenced mappings");
            return Err(Error::MappingsStillReferenced { device, remaining });
        }
        Ok(())
    }

    /// Tear down every mapping of a destroyed buffer and retire its entry,
    /// regardless of outstanding references.
    #[instrument(skip(self))]
    pub fn buffer_freed(&self, buffer: BufferId) {
        let Some(entry) = self.index.lookup(buffer) else {
            return;
        };

        let (unmap_list, consumed) = {
            let mut state = entry.write();
            if state.is_retired() {
                return;
            }
            state.retire();

            let drained = state.drain();
            let mut consumed = 0u32;
            for mapping in &drained {
                let held = mapping.refcount().take();
                consumed += held;
                if held > 1 {
                    CacheStats::bump(&self.stats.forced_detaches);
                    warn!(
                        device = %mapping.device(),
                        buffer = %entry.key(),
                        leaked = held - 1,
                        "buffer destroyed with mapping still referenced"
                    );
                }
            }
            (drained, consumed)
        };

        CacheStats::bump(&self.stats.buffers_freed);
        if self.index.erase(&entry) {
            CacheStats::bump(&self.stats.buffers_retired);
        }

        let count = unmap_list.len();
        for mapping in unmap_list {
            self.destroy_mapping(mapping);
        }

        // Whatever is left belongs to in-flight callers; they drop it later.
        entry.refcount().release_n(consumed);
        debug!(buffer = %entry.key(), mappings = count, "buffer freed");
    }

    /// Retire every cached buffer, as on service shutdown. Returns the number
    /// of buffers retired.
    pub fn teardown(&self) -> usize {
        let ids = self.index.ids();
        for id in &ids {
            self.buffer_freed(*id);
        }
        info!(buffers = ids.len(), "mapping cache torn down");
        ids.len()
    }

    fn put_buffer(&self, entry: &Arc<BufferEntry>) {
        if entry.refcount().release() && self.index.erase(entry) {
            CacheStats::bump(&self.stats.buffers_retired);
            debug!(buffer = %entry.key(), "retired buffer entry");
        }
    }

    fn destroy_mapping(&self, mapping: MappingEntry) {
        self.platform_unmap(&mapping);
        CacheStats::bump(&self.stats.mappings_destroyed);
        trace!(
            device = %mapping.device(),
            buffer = %mapping.buffer(),
            "destroyed mapping"
        );
    }

    fn platform_unmap(&self, mapping: &MappingEntry) {
        self.platform.unmap_sg(
            mapping.device(),
            mapping.segments(),
            mapping.nents(),
            mapping.direction(),
        );
        CacheStats::bump(&self.stats.platform_unmaps);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of cached buffers
    pub fn buffer_count(&self) -> usize {
        self.index.len()
    }

    /// Number of cached mappings across all buffers
    pub fn mapping_count(&self) -> usize {
        let mut total = 0;
        self.index.for_each(|entry| total += entry.read().len());
        total
    }

    pub fn contains_buffer(&self, buffer: BufferId) -> bool {
        self.index.contains(buffer)
    }

    pub fn buffer_refcount(&self, buffer: BufferId) -> Option<u32> {
        self.index.lookup(buffer).map(|e| e.refcount().get())
    }

    pub fn mapping_refcount(&self, buffer: BufferId, device: DeviceId) -> Option<u32> {
        let entry = self.index.lookup(buffer)?;
        let state = entry.read();
        state.find(device).map(|m| m.refcount().get())
    }

    /// Cached scatter list of `buffer` for `device`.
    pub fn cached_segments(&self, buffer: BufferId, device: DeviceId) -> Option<Vec<Segment>> {
        let entry = self.index.lookup(buffer)?;
        let state = entry.read();
        state.find(device).map(|m| m.segments().to_vec())
    }

    /// Devices currently holding a mapping of `buffer`.
    pub fn devices_for(&self, buffer: BufferId) -> Vec<DeviceId> {
        let Some(entry) = self.index.lookup(buffer) else {
            return Vec::new();
        };
        let mut devices: Vec<_> = entry.read().iter().map(|m| m.device()).collect();
        devices.sort();
        devices
    }
}

impl BufferDestroyedListener for MappingCache {
    fn on_buffer_destroyed(&self, buffer: BufferId) {
        self.buffer_freed(buffer);
    }
}

// =============================================================================
// Tests
// =============================================================================
