//! Mapping Cache
//!
//! Caches the device mappings of shared buffers so that consumers mapping the
//! same buffer for the same device pay for the platform map only once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          MappingCache                            │
//! │  map / unmap / unmap_all_for_device / buffer_freed / teardown   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  BufferIndex   RwLock<BTreeMap<BufferId, Arc<BufferEntry>>>      │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  BufferEntry   refcount  +  RwLock<MappingSet>                   │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  MappingEntry  one per device: segments, direction, refcount     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! - The index lock guards membership only; the entry lock guards the
//!   mapping set of one buffer
//! - Lock order is index, then entry. Nothing takes the index lock while
//!   holding an entry lock
//! - Refcounts are atomics outside both locks, so every map and unmap of an
//!   already cached mapping only ever shares the index lock
//! - Platform map and unmap calls run with no lock held

mod entry;
mod index;
mod manager;
mod refcount;
mod stats;

#[cfg(test)]
mod proptest;

pub use entry::{BufferEntry, BufferKey, MappingEntry, MappingSet};
pub use index::{BufferIndex, Insertion};
pub use manager::{MapOutcome, MappingCache};
pub use refcount::RefCount;
pub use stats::{CacheStats, StatsSnapshot};
