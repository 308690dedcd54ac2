//! Cache Entry Types
//!
//! A [`BufferEntry`] exists per cached buffer and owns one [`MappingEntry`]
//! per device that currently maps the buffer.

use std::fmt;

use crossbeam::utils::CachePadded;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::refcount::RefCount;
use crate::sg::{BufferId, DeviceId, DmaDirection, Segment};

/// Stale-checked handle to a buffer entry.
///
/// The generation changes every time an entry is created for an identity, so a
/// key held across a retire/recreate cycle no longer matches the new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferKey {
    pub id: BufferId,
    pub generation: u64,
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Cached mapping of one buffer for one device.
#[derive(Debug)]
pub struct MappingEntry {
    /// Consumer holding the mapping
    device: DeviceId,
    /// Owning buffer entry (non-owning back-reference)
    buffer: BufferKey,
    /// Mapped scatter list, as returned by the platform
    segments: Vec<Segment>,
    /// Direction fixed at creation
    direction: DmaDirection,
    /// Element count passed to the platform
    nents: usize,
    refcount: RefCount,
}

impl MappingEntry {
    pub(crate) fn new(
        device: DeviceId,
        buffer: BufferKey,
        segments: Vec<Segment>,
        direction: DmaDirection,
        initial_refcount: u32,
    ) -> Self {
        let nents = segments.len();
        Self {
            device,
            buffer,
            segments,
            direction,
            nents,
            refcount: RefCount::new(initial_refcount),
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn buffer(&self) -> BufferKey {
        self.buffer
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    #[inline]
    pub fn nents(&self) -> usize {
        self.nents
    }

    #[inline]
    pub fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    /// Copy the cached device addresses into a caller's scatter list.
    pub fn copy_into(&self, out: &mut [Segment]) {
        for (dst, src) in out.iter_mut().zip(&self.segments) {
            dst.copy_dma_from(src);
        }
    }
}

/// Mapping membership of a buffer entry, guarded by the entry lock.
#[derive(Debug, Default)]
pub struct MappingSet {
    mappings: Vec<MappingEntry>,
    /// Set once the buffer was destroyed; no mapping may be attached after.
    retired: bool,
}

impl MappingSet {
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.mappings.iter()
    }

    pub fn find(&self, device: DeviceId) -> Option<&MappingEntry> {
        self.mappings.iter().find(|m| m.device == device)
    }

    pub(crate) fn position(&self, device: DeviceId) -> Option<usize> {
        self.mappings.iter().position(|m| m.device == device)
    }

    pub(crate) fn get(&self, index: usize) -> &MappingEntry {
        &self.mappings[index]
    }

    /// Attach a mapping. The caller checked that `device` has none.
    pub(crate) fn attach(&mut self, mapping: MappingEntry) {
        debug_assert!(
            self.find(mapping.device).is_none(),
            "duplicate mapping for {}",
            mapping.device
        );
        self.mappings.push(mapping);
    }

    pub(crate) fn detach(&mut self, index: usize) -> MappingEntry {
        self.mappings.swap_remove(index)
    }

    pub(crate) fn drain(&mut self) -> Vec<MappingEntry> {
        std::mem::take(&mut self.mappings)
    }
}

/// Cached state of one buffer.
#[derive(Debug)]
pub struct BufferEntry {
    key: BufferKey,
    /// Never less than the sum of the mapping refcounts
    refcount: CachePadded<RefCount>,
    state: RwLock<MappingSet>,
}

impl BufferEntry {
    pub(crate) fn new(key: BufferKey, initial_refcount: u32) -> Self {
        Self {
            key,
            refcount: CachePadded::new(RefCount::new(initial_refcount)),
            state: RwLock::new(MappingSet::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.key.id
    }

    #[inline]
    pub fn key(&self) -> BufferKey {
        self.key
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.key.generation
    }

    #[inline]
    pub fn refcount(&self) -> &RefCount {
        &self.refcount
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MappingSet> {
        self.state.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, MappingSet> {
        self.state.write()
    }
}
