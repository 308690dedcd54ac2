//! Atomic reference counts
//!
//! Refcounts are mutated without holding the structural locks. Taking a new
//! reference through a lookup uses increment-if-not-zero, so a count that has
//! reached zero is never brought back.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free reference count.
#[derive(Debug)]
pub struct RefCount(AtomicU32);

impl RefCount {
    /// Create a count seeded at `initial`.
    pub fn new(initial: u32) -> Self {
        Self(AtomicU32::new(initial))
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Add one reference. The caller must already hold a reference, or hold
    /// the lock that keeps the owner alive.
    #[inline]
    pub fn acquire(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` references, under the same rule as [`RefCount::acquire`].
    #[inline]
    pub fn acquire_n(&self, n: u32) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Add one reference unless the count already reached zero.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference. Returns `true` when this dropped the last one.
    #[inline]
    pub fn release(&self) -> bool {
        self.release_n(1)
    }

    /// Drop `n` references. Returns `true` when the count reached zero.
    ///
    /// Saturates at zero; releasing more than is held is a contract violation.
    pub fn release_n(&self, n: u32) -> bool {
        if n == 0 {
            return false;
        }
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            })
            .unwrap_or_else(|c| c);
        debug_assert!(prev >= n, "refcount underflow: {} - {}", prev, n);
        prev != 0 && prev <= n
    }

    /// Drop every reference at once, returning how many were held.
    #[inline]
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::AcqRel)
    }
}
