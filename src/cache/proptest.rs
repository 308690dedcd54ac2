//! Property-Based Tests for the Mapping Cache
//!
//! Runs random single-threaded operation sequences against the cache and a
//! plain reference model, checking after every step that both agree.
//!
//! # Test Properties
//!
//! 1. **Refcount Agreement**: every mapping refcount matches the model
//! 2. **Buffer Accounting**: a buffer's refcount equals the sum of its mapping
//!    refcounts when no call is in flight, and the buffer is cached exactly
//!    while that sum is non-zero
//! 3. **No Leaks**: live platform mappings equal cached mappings, and nothing
//!    is ever unmapped twice
//! 4. **Clean Teardown**: retiring every buffer leaves nothing mapped

#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;

use super::MappingCache;
use crate::mock::MockPlatform;
use crate::sg::{BufferId, DeviceId, DmaDirection, MapAttrs, Segment};

#[derive(Debug, Clone)]
enum Op {
    Map {
        device: u32,
        buffer: u64,
        eager: bool,
    },
    Unmap { device: u32, buffer: u64 },
    Sweep { device: u32 },
    Free { buffer: u64 },
}

// =============================================================================
// Property Strategies
// =============================================================================

/// Small identity spaces so operations collide often.
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..3, 0u64..4, any::<bool>())
            .prop_map(|(device, buffer, eager)| Op::Map {
                device,
                buffer,
                eager,
            }),
        4 => (0u32..3, 0u64..4).prop_map(|(device, buffer)| Op::Unmap { device, buffer }),
        1 => (0u32..3).prop_map(|device| Op::Sweep { device }),
        1 => (0u64..4).prop_map(|buffer| Op::Free { buffer }),
    ]
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..120)
}

// =============================================================================
// Model
// =============================================================================

/// Mapping refcounts keyed by (buffer, device).
type Model = BTreeMap<(u64, u32), u32>;

fn apply(cache: &MappingCache, model: &mut Model, op: &Op) -> Result<(), TestCaseError> {
    match *op {
        Op::Map {
            device,
            buffer,
            eager,
        } => {
            let attrs = if eager {
                MapAttrs::eager()
            } else {
                MapAttrs::deferred()
            };
            let mut segs = vec![Segment::new(buffer, 0, 4096)];
            let out = cache
                .map(
                    DeviceId(device),
                    &mut segs,
                    DmaDirection::Bidirectional,
                    BufferId(buffer),
                    attrs,
                )
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let slot = model.entry((buffer, device)).or_insert(0);
            prop_assert_eq!(out.cache_hit, *slot != 0);
            *slot += if *slot == 0 {
                attrs.initial_refcount()
            } else {
                1
            };
        }
        Op::Unmap { device, buffer } => {
            let released = cache.unmap(DeviceId(device), BufferId(buffer));
            let expected = match model.get_mut(&(buffer, device)) {
                Some(refs) => {
                    *refs -= 1;
                    if *refs == 0 {
                        model.remove(&(buffer, device));
                    }
                    true
                }
                None => false,
            };
            prop_assert_eq!(released, expected);
        }
        Op::Sweep { device } => {
            let result = cache.unmap_all_for_device(DeviceId(device));
            let mut remaining = 0;
            model.retain(|&(_, d), refs| {
                if d != device {
                    return true;
                }
                *refs -= 1;
                if *refs > 0 {
                    remaining += 1;
                }
                *refs > 0
            });
            prop_assert_eq!(result.is_ok(), remaining == 0);
        }
        Op::Free { buffer } => {
            cache.buffer_freed(BufferId(buffer));
            model.retain(|&(b, _), _| b != buffer);
        }
    }
    Ok(())
}

fn check(
    cache: &MappingCache,
    platform: &MockPlatform,
    model: &Model,
) -> Result<(), TestCaseError> {
    for buffer in 0u64..4 {
        let expected: u32 = model
            .iter()
            .filter(|((b, _), _)| *b == buffer)
            .map(|(_, refs)| *refs)
            .sum();
        let actual = cache.buffer_refcount(BufferId(buffer));
        if expected == 0 {
            prop_assert_eq!(actual, None);
        } else {
            prop_assert_eq!(actual, Some(expected));
        }

        for device in 0u32..3 {
            prop_assert_eq!(
                cache.mapping_refcount(BufferId(buffer), DeviceId(device)),
                model.get(&(buffer, device)).copied()
            );
        }
    }

    prop_assert_eq!(cache.mapping_count(), model.len());
    prop_assert_eq!(platform.live_mappings(), model.len());
    prop_assert_eq!(platform.double_unmaps(), 0);
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_cache_matches_model(ops in ops_strategy()) {
        let platform = Arc::new(MockPlatform::new());
        let cache = MappingCache::new(platform.clone());
        let mut model = Model::new();

        for op in &ops {
            apply(&cache, &mut model, op)?;
            check(&cache, &platform, &model)?;
        }
    }

    #[test]
    fn prop_teardown_leaves_nothing_mapped(ops in ops_strategy()) {
        let platform = Arc::new(MockPlatform::new());
        let cache = MappingCache::new(platform.clone());
        let mut model = Model::new();

        for op in &ops {
            apply(&cache, &mut model, op)?;
        }
        cache.teardown();

        prop_assert_eq!(cache.buffer_count(), 0);
        prop_assert_eq!(platform.live_mappings(), 0);
        prop_assert_eq!(platform.double_unmaps(), 0);
        prop_assert_eq!(platform.map_calls(), platform.unmap_calls());
    }

    #[test]
    fn prop_platform_maps_once_per_cached_pair(
        device in 0u32..8,
        buffer in 0u64..1024,
        repeats in 1usize..20,
    ) {
        let platform = Arc::new(MockPlatform::new());
        let cache = MappingCache::new(platform.clone());

        for _ in 0..repeats {
            let mut segs = vec![Segment::new(buffer, 0, 512)];
            cache
                .map(
                    DeviceId(device),
                    &mut segs,
                    DmaDirection::ToDevice,
                    BufferId(buffer),
                    MapAttrs::deferred(),
                )
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        prop_assert_eq!(platform.map_calls(), 1);
        prop_assert_eq!(
            cache.mapping_refcount(BufferId(buffer), DeviceId(device)),
            Some(repeats as u32)
        );

        for _ in 0..repeats {
            prop_assert!(cache.unmap(DeviceId(device), BufferId(buffer)));
        }
        prop_assert!(!cache.contains_buffer(BufferId(buffer)));
        prop_assert_eq!(platform.unmap_calls(), 1);
    }
}
