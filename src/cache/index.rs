//! Buffer Index
//!
//! Ordered map from buffer identity to its [`BufferEntry`], behind a single
//! reader/writer lock.
//!
//! # Design
//!
//! - Lookups share the read lock; insert and erase take it exclusively
//! - Entries are reference counted separately from the lock, so a lookup
//!   never changes a refcount unless asked to ([`BufferIndex::lookup_get`])
//! - Erase removes the exact record it is given, never a newer entry that
//!   reuses the same identity

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::entry::{BufferEntry, BufferKey};
use crate::sg::BufferId;

/// Result of [`BufferIndex::insert`].
#[derive(Debug)]
pub enum Insertion {
    /// The new entry is now indexed
    Inserted(Arc<BufferEntry>),
    /// A live entry for the identity already existed; a reference on it was
    /// taken and the new entry was discarded
    Existing(Arc<BufferEntry>),
}

impl Insertion {
    pub fn into_entry(self) -> Arc<BufferEntry> {
        match self {
            Insertion::Inserted(e) | Insertion::Existing(e) => e,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Insertion::Inserted(_))
    }
}

/// Index of cached buffers.
#[derive(Debug)]
pub struct BufferIndex {
    map: RwLock<BTreeMap<BufferId, Arc<BufferEntry>>>,
    /// Source of entry generations
    next_generation: AtomicU64,
    /// Number of lookups
    reads: AtomicU64,
    /// Number of inserts and erases
    writes: AtomicU64,
}

impl Default for BufferIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            next_generation: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Allocate a key for a new entry of `id`.
    pub fn next_key(&self, id: BufferId) -> BufferKey {
        BufferKey {
            id,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of indexed buffers
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(&id)
    }

    /// Find the entry for `id` without touching its refcount.
    pub fn lookup(&self, id: BufferId) -> Option<Arc<BufferEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(&id).cloned()
    }

    /// Find the entry for `key`, but only if it is still the same generation.
    pub fn lookup_key(&self, key: BufferKey) -> Option<Arc<BufferEntry>> {
        self.lookup(key.id)
            .filter(|e| e.generation() == key.generation)
    }

    /// Find the entry for `id` and take a reference on it.
    ///
    /// An entry whose refcount already reached zero is about to be erased by
    /// its last holder and is reported as not found.
    pub fn lookup_get(&self, id: BufferId) -> Option<Arc<BufferEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let guard = self.map.read();
        guard
            .get(&id)
            .filter(|e| e.refcount().try_acquire())
            .cloned()
    }

    /// Insert a freshly created entry that already carries the caller's
    /// reference.
    ///
    /// Double-checks under the write lock: if a racing caller indexed a live
    /// entry for the same identity first, that one is returned instead.
    pub fn insert(&self, entry: Arc<BufferEntry>) -> Insertion {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();

        if let Some(existing) = guard.get(&entry.id()) {
            if existing.refcount().try_acquire() {
                return Insertion::Existing(Arc::clone(existing));
            }
        }

        // Any entry displaced here had a zero refcount; its erase will miss.
        guard.insert(entry.id(), Arc::clone(&entry));
        Insertion::Inserted(entry)
    }

    /// Remove `entry` if it is still the indexed record for its identity.
    pub fn erase(&self, entry: &Arc<BufferEntry>) -> bool {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();

        match guard.get(&entry.id()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                guard.remove(&entry.id());
                true
            }
            _ => false,
        }
    }

    /// Visit every entry in ascending identity order under the read lock.
    ///
    /// Membership is stable for the duration; `f` must not call back into
    /// insert or erase.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<BufferEntry>),
    {
        let guard = self.map.read();
        for entry in guard.values() {
            f(entry);
        }
    }

    /// All indexed identities, in order.
    pub fn ids(&self) -> Vec<BufferId> {
        self.map.read().keys().copied().collect()
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn new_entry(index: &BufferIndex, id: u64) -> Arc<BufferEntry> {
        Arc::new(BufferEntry::new(index.next_key(BufferId(id)), 1))
    }

    #[test]
    fn test_index_creation() {
        let index = BufferIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.len(), 0);
        assert!(index.lookup(BufferId(1)).is_none());
    }

    #[test]
    fn test_insert_lookup() {
        let index = BufferIndex::new();
        let entry = new_entry(&index, 0x1000);

        assert!(index.insert(Arc::clone(&entry)).is_inserted());
        assert_eq!(index.len(), 1);

        let found = index.lookup(BufferId(0x1000)).unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        // Plain lookup leaves the refcount alone
        assert_eq!(entry.refcount().get(), 1);
    }

    #[test]
    fn test_lookup_get_takes_reference() {
        let index = BufferIndex::new();
        let entry = new_entry(&index, 1);
        index.insert(Arc::clone(&entry));

        let found = index.lookup_get(BufferId(1)).unwrap();
        assert_eq!(found.refcount().get(), 2);
    }

    #[test]
    fn test_lookup_get_skips_dying_entry() {
        // Refcount already at zero but not yet erased: the narrow window
        // between the last release and erase. It must look absent and must
        // not come back to life.
        let index = BufferIndex::new();
        let entry = new_entry(&index, 1);
        index.insert(Arc::clone(&entry));
        assert!(entry.refcount().release());

        assert!(index.lookup_get(BufferId(1)).is_none());
        assert_eq!(entry.refcount().get(), 0);
        assert!(index.contains(BufferId(1)));
    }

    #[test]
    fn test_insert_returns_existing_live_entry() {
        let index = BufferIndex::new();
        let first = new_entry(&index, 7);
        index.insert(Arc::clone(&first));

        let second = new_entry(&index, 7);
        match index.insert(second) {
            Insertion::Existing(e) => {
                assert!(Arc::ptr_eq(&e, &first));
                assert_eq!(first.refcount().get(), 2);
            }
            Insertion::Inserted(_) => panic!("duplicate entry indexed"),
        }
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insert_replaces_dying_entry_and_erase_spares_it() {
        let index = BufferIndex::new();
        let old = new_entry(&index, 7);
        index.insert(Arc::clone(&old));
        assert!(old.refcount().release());

        let new = new_entry(&index, 7);
        assert!(index.insert(Arc::clone(&new)).is_inserted());

        // The old holder's erase must not remove the replacement
        assert!(!index.erase(&old));
        let found = index.lookup(BufferId(7)).unwrap();
        assert!(Arc::ptr_eq(&found, &new));
        assert_ne!(old.generation(), new.generation());
    }

    #[test]
    fn test_erase() {
        let index = BufferIndex::new();
        let entry = new_entry(&index, 3);
        index.insert(Arc::clone(&entry));

        assert!(index.erase(&entry));
        assert!(!index.erase(&entry));
        assert!(index.is_empty());
    }

    #[test]
    fn test_lookup_key_checks_generation() {
        let index = BufferIndex::new();
        let entry = new_entry(&index, 3);
        let key = entry.key();
        index.insert(Arc::clone(&entry));
        assert!(index.lookup_key(key).is_some());

        index.erase(&entry);
        let again = new_entry(&index, 3);
        index.insert(again);
        assert!(index.lookup_key(key).is_none());
    }

    #[test]
    fn test_for_each_is_ordered() {
        let index = BufferIndex::new();
        for id in [30u64, 10, 20] {
            index.insert(new_entry(&index, id));
        }

        let mut seen = Vec::new();
        index.for_each(|e| seen.push(e.id().raw()));
        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(index.ids(), vec![BufferId(10), BufferId(20), BufferId(30)]);
    }

    #[test]
    fn test_statistics() {
        let index = BufferIndex::new();
        let entry = new_entry(&index, 1);
        index.insert(Arc::clone(&entry));
        index.lookup(BufferId(1));
        index.lookup(BufferId(2));
        index.erase(&entry);

        assert_eq!(index.read_count(), 2);
        assert_eq!(index.write_count(), 2);
    }
}
