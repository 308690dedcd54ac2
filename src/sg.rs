//! Scatter/gather descriptions and identities
//!
//! A buffer reaches a device as a list of [`Segment`]s. Before mapping, each
//! segment describes a piece of the buffer's backing memory (page, offset,
//! length). After the platform maps it, the segment also carries the
//! device-visible address and length.
//!
//! Buffers and devices are opaque to the cache: [`BufferId`] and [`DeviceId`]
//! are plain comparable values handed in by the owning subsystems.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of a shared buffer.
///
/// Ordered by raw value; the buffer index is sorted on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl BufferId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf:{:#x}", self.0)
    }
}

impl From<u64> for BufferId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Opaque identity of a mapping consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Transfer direction of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmaDirection {
    /// Device reads and writes
    Bidirectional,
    /// Memory to device
    ToDevice,
    /// Device to memory
    FromDevice,
    /// No data transfer (address reservation only)
    None,
}

impl fmt::Display for DmaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaDirection::Bidirectional => write!(f, "bidirectional"),
            DmaDirection::ToDevice => write!(f, "to-device"),
            DmaDirection::FromDevice => write!(f, "from-device"),
            DmaDirection::None => write!(f, "none"),
        }
    }
}

/// One scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Segment {
    /// Page frame (or page link) of the backing memory
    pub page: u64,
    /// Offset into the page
    pub offset: u32,
    /// Length of the backing memory piece in bytes
    pub length: u32,
    /// Device-visible address, filled in by the platform
    pub dma_address: u64,
    /// Device-visible length, filled in by the platform
    pub dma_length: u32,
}

impl Segment {
    /// Create an unmapped segment.
    pub fn new(page: u64, offset: u32, length: u32) -> Self {
        Self {
            page,
            offset,
            length,
            dma_address: 0,
            dma_length: 0,
        }
    }

    /// Returns `true` once the platform has assigned a device address.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.dma_length != 0
    }

    /// Copy the device-visible part of `other` into this segment.
    #[inline]
    pub fn copy_dma_from(&mut self, other: &Segment) {
        self.dma_address = other.dma_address;
        self.dma_length = other.dma_length;
    }
}

/// Attributes passed with a map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapAttrs {
    /// Seed new entries with an extra reference, so the first unmap does not
    /// release them and a second release is needed.
    pub eager_reclaim: bool,
    /// Platform-specific attribute bits, passed through untouched
    pub raw: u64,
}

impl MapAttrs {
    /// Attributes for the default deferred-reclaim mode.
    pub fn deferred() -> Self {
        Self::default()
    }

    /// Attributes with `eager_reclaim` set.
    pub fn eager() -> Self {
        Self {
            eager_reclaim: true,
            raw: 0,
        }
    }

    /// Initial refcount for a newly created entry.
    #[inline]
    pub fn initial_refcount(&self) -> u32 {
        if self.eager_reclaim {
            2
        } else {
            1
        }
    }
}
