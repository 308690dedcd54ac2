//! Platform Ports
//!
//! The cache never touches page tables or allocators directly. It calls into
//! the collaborators defined here, which an embedding system implements.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MappingCache                           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     ▲
//!          ▼                    ▼                     │
//! ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐
//! │ MappingPlatform │  │ RecordAllocator │  │ BufferDestroyedListener │
//! │ map / unmap /   │  │ try_reserve     │  │ on_buffer_destroyed     │
//! │ requires_barrier│  │                 │  │ (buffer subsystem)      │
//! └─────────────────┘  └─────────────────┘  └─────────────────────────┘
//! ```

use thiserror::Error;

use crate::sg::{BufferId, DeviceId, DmaDirection, MapAttrs, Segment};

/// Transient failure of the platform map primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("platform map failed: {reason}")]
pub struct MapFailure {
    pub reason: String,
}

impl MapFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Transient failure of the record allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no memory for {kind} record ({size} bytes)")]
pub struct AllocFailure {
    pub kind: RecordKind,
    pub size: usize,
}

/// Kind of bookkeeping record being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    BufferEntry,
    MappingEntry,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::BufferEntry => "buffer entry",
            RecordKind::MappingEntry => "mapping entry",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The costly device mapping primitive.
///
/// Implementations may block for an unbounded time; the cache calls them
/// outside of all internal locks.
pub trait MappingPlatform: Send + Sync {
    /// Map `segments` for `device`, filling in `dma_address`/`dma_length`.
    fn map_sg(
        &self,
        device: DeviceId,
        segments: &mut [Segment],
        direction: DmaDirection,
        attrs: &MapAttrs,
    ) -> Result<(), MapFailure>;

    /// Reverse a mapping produced by [`MappingPlatform::map_sg`].
    fn unmap_sg(
        &self,
        device: DeviceId,
        segments: &[Segment],
        nents: usize,
        direction: DmaDirection,
    );

    /// Whether reusing a cached mapping for `device` needs a memory barrier.
    fn requires_barrier(&self, device: DeviceId) -> bool;
}

/// Allocator for bookkeeping records.
pub trait RecordAllocator: Send + Sync {
    /// Reserve room for one record of `kind`.
    fn try_reserve(&self, kind: RecordKind, size: usize) -> Result<(), AllocFailure>;
}

/// Allocator backed by the global heap; never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl RecordAllocator for HeapAllocator {
    fn try_reserve(&self, _kind: RecordKind, _size: usize) -> Result<(), AllocFailure> {
        Ok(())
    }
}

/// Notification hook for the subsystem that owns buffer identity.
pub trait BufferDestroyedListener: Send + Sync {
    /// Called exactly once when the buffer's last owner releases it.
    fn on_buffer_destroyed(&self, buffer: BufferId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            MapFailure::new("iova space exhausted").to_string(),
            "platform map failed: iova space exhausted"
        );
        let alloc = AllocFailure {
            kind: RecordKind::MappingEntry,
            size: 96,
        };
        assert_eq!(
            alloc.to_string(),
            "no memory for mapping entry record (96 bytes)"
        );
    }

    #[test]
    fn test_failures_are_std_errors() {
        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(MapFailure::new("busy"));
        assert!(err.source().is_none());
        let err: Box<dyn std::error::Error> = Box::new(AllocFailure {
            kind: RecordKind::BufferEntry,
            size: 64,
        });
        assert!(err.to_string().starts_with("no memory for buffer entry"));
    }
}
