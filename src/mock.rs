//! Mock platform for testing without real mapping hardware
//!
//! [`MockPlatform`] hands out fake device addresses from a monotonically
//! growing window and records every live mapping, so tests can check that no
//! mapping is leaked or unmapped twice. Failures, latency and barrier
//! requirements can be injected per instance. [`FlakyAllocator`] does the same
//! for record allocation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::platform::{AllocFailure, MapFailure, MappingPlatform, RecordAllocator, RecordKind};
use crate::sg::{DeviceId, DmaDirection, MapAttrs, Segment};

/// First device address handed out by the mock
pub const MOCK_IOVA_BASE: u64 = 0x1_0000_0000;

/// Mock mapping granule (4KB)
pub const MOCK_PAGE_SIZE: u64 = 4096;

/// Page-aligned slot size for a segment of `length` bytes.
fn slot_len(length: u32) -> u64 {
    (length as u64).max(1).div_ceil(MOCK_PAGE_SIZE) * MOCK_PAGE_SIZE
}

/// Take one unit from an injected failure budget.
fn consume(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory stand-in for a device mapping backend.
#[derive(Debug)]
pub struct MockPlatform {
    next_iova: AtomicU64,
    fail_next: AtomicU32,
    /// Fail every n-th attempt (0 disables)
    fail_every: AtomicU64,
    map_latency_us: AtomicU64,
    barrier_devices: RwLock<HashSet<DeviceId>>,
    /// Live mappings keyed by device and first device address
    live: Mutex<HashMap<(DeviceId, u64), usize>>,
    attempts: AtomicU64,
    map_calls: AtomicU64,
    failed_maps: AtomicU64,
    unmap_calls: AtomicU64,
    double_unmaps: AtomicU64,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            next_iova: AtomicU64::new(MOCK_IOVA_BASE),
            fail_next: AtomicU32::new(0),
            fail_every: AtomicU64::new(0),
            map_latency_us: AtomicU64::new(0),
            barrier_devices: RwLock::new(HashSet::new()),
            live: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
            map_calls: AtomicU64::new(0),
            failed_maps: AtomicU64::new(0),
            unmap_calls: AtomicU64::new(0),
            double_unmaps: AtomicU64::new(0),
        }
    }

    /// Builder form of [`MockPlatform::set_requires_barrier`].
    pub fn with_barrier_device(self, device: DeviceId) -> Self {
        self.set_requires_barrier(device, true);
        self
    }

    pub fn set_requires_barrier(&self, device: DeviceId, required: bool) {
        let mut devices = self.barrier_devices.write();
        if required {
            devices.insert(device);
        } else {
            devices.remove(&device);
        }
    }

    /// Make the next `n` map attempts fail.
    pub fn fail_next_maps(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Make every `n`-th map attempt fail (0 disables).
    pub fn fail_every(&self, n: u64) {
        self.fail_every.store(n, Ordering::Release);
    }

    /// Block every map call for `latency`.
    pub fn set_map_latency(&self, latency: Duration) {
        self.map_latency_us
            .store(latency.as_micros() as u64, Ordering::Release);
    }

    /// Successful map calls
    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Acquire)
    }

    /// Map attempts that were made to fail
    pub fn failed_maps(&self) -> u64 {
        self.failed_maps.load(Ordering::Acquire)
    }

    pub fn unmap_calls(&self) -> u64 {
        self.unmap_calls.load(Ordering::Acquire)
    }

    /// Unmap calls for a mapping that was not live
    pub fn double_unmaps(&self) -> u64 {
        self.double_unmaps.load(Ordering::Acquire)
    }

    /// Mappings currently live in the mock
    pub fn live_mappings(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_live(&self, device: DeviceId, dma_address: u64) -> bool {
        self.live.lock().contains_key(&(device, dma_address))
    }

    fn should_fail(&self) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if consume(&self.fail_next) {
            return true;
        }
        let every = self.fail_every.load(Ordering::Acquire);
        every != 0 && attempt % every == 0
    }
}

impl MappingPlatform for MockPlatform {
    fn map_sg(
        &self,
        device: DeviceId,
        segments: &mut [Segment],
        _direction: DmaDirection,
        _attrs: &MapAttrs,
    ) -> Result<(), MapFailure> {
        if self.should_fail() {
            self.failed_maps.fetch_add(1, Ordering::Relaxed);
            return Err(MapFailure::new("injected failure"));
        }

        let latency = self.map_latency_us.load(Ordering::Acquire);
        if latency > 0 {
            std::thread::sleep(Duration::from_micros(latency));
        }

        // Each segment gets its own page-aligned slot
        let span: u64 = segments
            .iter()
            .map(|s| slot_len(s.length))
            .sum::<u64>()
            .max(MOCK_PAGE_SIZE);
        let mut iova = self.next_iova.fetch_add(span, Ordering::AcqRel);
        for seg in segments.iter_mut() {
            seg.dma_address = iova + seg.offset as u64;
            seg.dma_length = seg.length;
            iova += slot_len(seg.length);
        }

        if let Some(first) = segments.first() {
            self.live
                .lock()
                .insert((device, first.dma_address), segments.len());
        }
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn unmap_sg(
        &self,
        device: DeviceId,
        segments: &[Segment],
        nents: usize,
        _direction: DmaDirection,
    ) {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
        let Some(first) = segments.first() else {
            return;
        };

        match self.live.lock().remove(&(device, first.dma_address)) {
            Some(mapped) => debug_assert_eq!(mapped, nents, "unmap with a different nents"),
            None => {
                self.double_unmaps.fetch_add(1, Ordering::Relaxed);
                warn!(
                    %device,
                    dma_address = first.dma_address,
                    "unmap of a mapping that is not live"
                );
            }
        }
    }

    fn requires_barrier(&self, device: DeviceId) -> bool {
        self.barrier_devices.read().contains(&device)
    }
}

/// Record allocator with injectable failures.
#[derive(Debug, Default)]
pub struct FlakyAllocator {
    /// Successes granted before `fail_next` applies
    skip: AtomicU32,
    fail_next: AtomicU32,
    failures: AtomicU64,
    reservations: AtomicU64,
}

impl FlakyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reservations fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Let the next `skip` reservations succeed, then fail `n`.
    pub fn fail_after(&self, skip: u32, n: u32) {
        self.skip.store(skip, Ordering::Release);
        self.fail_next.store(n, Ordering::Release);
    }

    /// Reservations that were made to fail
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Successful reservations
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::Acquire)
    }
}

impl RecordAllocator for FlakyAllocator {
    fn try_reserve(&self, kind: RecordKind, size: usize) -> Result<(), AllocFailure> {
        if !consume(&self.skip) && consume(&self.fail_next) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(AllocFailure { kind, size });
        }
        self.reservations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs() -> Vec<Segment> {
        vec![Segment::new(1, 0, 4096), Segment::new(2, 128, 100)]
    }

    fn map_on(platform: &MockPlatform, segs: &mut [Segment]) -> Result<(), MapFailure> {
        platform.map_sg(DeviceId(1), segs, DmaDirection::None, &MapAttrs::default())
    }

    #[test]
    fn test_map_assigns_distinct_addresses() {
        let platform = MockPlatform::new();
        let mut a = segs();
        let mut b = segs();
        map_on(&platform, &mut a).unwrap();
        map_on(&platform, &mut b).unwrap();

        assert_eq!(a[0].dma_address, MOCK_IOVA_BASE);
        assert_eq!(a[1].dma_address, MOCK_IOVA_BASE + MOCK_PAGE_SIZE + 128);
        assert_eq!(a[1].dma_length, 100);
        assert_ne!(a[0].dma_address, b[0].dma_address);
        assert_eq!(platform.live_mappings(), 2);
    }

    #[test]
    fn test_unmap_tracks_double_unmaps() {
        let platform = MockPlatform::new();
        let mut s = segs();
        map_on(&platform, &mut s).unwrap();
        assert!(platform.is_live(DeviceId(1), s[0].dma_address));

        platform.unmap_sg(DeviceId(1), &s, 2, DmaDirection::None);
        assert_eq!(platform.live_mappings(), 0);
        assert_eq!(platform.double_unmaps(), 0);

        platform.unmap_sg(DeviceId(1), &s, 2, DmaDirection::None);
        assert_eq!(platform.double_unmaps(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let platform = MockPlatform::new();
        platform.fail_next_maps(2);
        let mut s = segs();

        assert!(map_on(&platform, &mut s).is_err());
        assert!(map_on(&platform, &mut s).is_err());
        assert!(map_on(&platform, &mut s).is_ok());
        assert_eq!(platform.failed_maps(), 2);
        assert_eq!(platform.map_calls(), 1);
    }

    #[test]
    fn test_fail_every() {
        let platform = MockPlatform::new();
        platform.fail_every(3);
        let results: Vec<bool> = (0..6)
            .map(|_| map_on(&platform, &mut segs()).is_ok())
            .collect();
        assert_eq!(results, vec![true, true, false, true, true, false]);
    }

    #[test]
    fn test_barrier_devices() {
        let platform = MockPlatform::new().with_barrier_device(DeviceId(4));
        assert!(platform.requires_barrier(DeviceId(4)));
        assert!(!platform.requires_barrier(DeviceId(5)));
        platform.set_requires_barrier(DeviceId(4), false);
        assert!(!platform.requires_barrier(DeviceId(4)));
    }

    #[test]
    fn test_flaky_allocator() {
        let alloc = FlakyAllocator::new();
        alloc.fail_next(1);
        assert!(alloc.try_reserve(RecordKind::BufferEntry, 64).is_err());
        assert!(alloc.try_reserve(RecordKind::MappingEntry, 64).is_ok());
        assert_eq!(alloc.failures(), 1);
        assert_eq!(alloc.reservations(), 1);
    }

    #[test]
    fn test_flaky_allocator_fail_after() {
        let alloc = FlakyAllocator::new();
        alloc.fail_after(2, 1);
        let outcomes: Vec<bool> = (0..4)
            .map(|_| alloc.try_reserve(RecordKind::MappingEntry, 64).is_ok())
            .collect();
        assert_eq!(outcomes, vec![true, true, false, true]);
        assert_eq!(alloc.failures(), 1);
        assert_eq!(alloc.reservations(), 3);
    }
}
