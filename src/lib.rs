//! IOMMU Mapping Cache - shared DMA mapping reuse for multi-device buffers
//!
//! Buffers shared between several devices are typically mapped for DMA over
//! and over again by the same consumers, and every platform map is costly.
//! This crate keeps those mappings alive with reference counting, so repeated
//! map requests for the same buffer and device are served from cache.
//!
//! # Architecture
//!
//! ```text
//! consumer ──map/unmap──▶ MappingCache ──map_sg/unmap_sg──▶ MappingPlatform
//!                              ▲
//! buffer subsystem ─buffer_freed┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Buffer index, mapping entries and the cache operations
//! - [`config`] - Retry configuration, loadable from YAML or JSON
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus text exposition of cache statistics
//! - [`mock`] - In-memory platform for tests and the stress driver
//! - [`platform`] - Traits the embedding system implements
//! - [`retry`] - Retry policies for allocation and mapping
//! - [`sg`] - Identities, scatter segments and map attributes

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod platform;
pub mod retry;
pub mod sg;

// Re-export commonly used types
pub use cache::{MapOutcome, MappingCache, StatsSnapshot};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use platform::{BufferDestroyedListener, MappingPlatform, RecordAllocator};
pub use retry::RetryPolicy;
pub use sg::{BufferId, DeviceId, DmaDirection, MapAttrs, Segment};
