//! Caching allocator behaviour on the simulated driver

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{SimFixture, KIB, MIB};
use npuforge::allocator::config::{LARGE_BUFFER, SMALL_BUFFER};
use npuforge::allocator::{
    AllocatorConfig, BlockPool, BlockState, NpuAllocator, RecordContext, StatType, TraceAction,
};
use npuforge::backend::acl_backend::DeviceIndex;
use npuforge::NpuForgeError;
use proptest::prelude::*;

#[test]
fn test_two_small_allocations_share_one_segment() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);

    let a = fixture.allocator.raw_alloc_with_stream(4 * KIB, &stream).unwrap();
    let b = fixture.allocator.raw_alloc_with_stream(4 * KIB, &stream).unwrap();
    assert_ne!(a, b);

    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.allocated_bytes.all.current, 8192);
    assert_eq!(stats.segment.all.current, 1);
    assert!(stats.reserved_bytes.all.current >= 8192);
    assert_eq!(fixture.malloc_calls(0), 1);

    let (base_a, size_a) = fixture.allocator.get_base_allocation(a).unwrap();
    let (base_b, _) = fixture.allocator.get_base_allocation(b).unwrap();
    assert_eq!(base_a, base_b);
    assert_eq!(size_a, SMALL_BUFFER);

    fixture.allocator.raw_delete(a).unwrap();
    fixture.allocator.raw_delete(b).unwrap();
    fixture.assert_no_leak(0);
}

#[test]
fn test_empty_cache_forces_new_native_allocation() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);

    let ptr = fixture.allocator.raw_alloc_with_stream(MIB, &stream).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();
    fixture.allocator.empty_cache().unwrap();
    assert_eq!(fixture.driver.live_allocations(0).unwrap(), 0);

    let before = fixture.malloc_calls(0);
    let ptr = fixture.allocator.raw_alloc_with_stream(MIB, &stream).unwrap();
    assert_eq!(fixture.malloc_calls(0), before + 1);
    fixture.allocator.raw_delete(ptr).unwrap();
}

#[test]
fn test_freed_block_is_reused_without_native_call() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);

    let first = fixture.allocator.raw_alloc_with_stream(3 * MIB, &stream).unwrap();
    fixture.allocator.raw_delete(first).unwrap();
    let calls = fixture.malloc_calls(0);

    let second = fixture.allocator.raw_alloc_with_stream(3 * MIB, &stream).unwrap();
    assert_eq!(second, first);
    assert_eq!(fixture.malloc_calls(0), calls);
    fixture.allocator.raw_delete(second).unwrap();
}

#[test]
fn test_blocks_are_not_shared_across_streams() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let s1 = fixture.pool_stream(0, false);
    let s2 = fixture.pool_stream(0, false);
    assert_ne!(s1, s2);

    let ptr = fixture.allocator.raw_alloc_with_stream(4 * KIB, &s1).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();
    let other = fixture.allocator.raw_alloc_with_stream(4 * KIB, &s2).unwrap();
    assert_ne!(
        fixture.allocator.get_base_allocation(other).unwrap().0,
        ptr,
        "a block cached for one stream must not serve another"
    );
    assert_eq!(fixture.malloc_calls(0), 2);
    fixture.allocator.raw_delete(other).unwrap();
}

#[test]
fn test_split_blocks_merge_back() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);

    let ptrs: Vec<_> = (0..4)
        .map(|_| fixture.allocator.raw_alloc_with_stream(100 * KIB, &stream).unwrap())
        .collect();
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.segment.all.current, 1);
    assert_eq!(stats.inactive_split.all.current, 1);

    // Free out of order so both neighbours get merged.
    for index in [1, 3, 0, 2] {
        fixture.allocator.raw_delete(ptrs[index]).unwrap();
    }
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.active.all.current, 0);
    assert_eq!(stats.inactive_split.all.current, 0);
    assert_eq!(stats.inactive_split_bytes.all.current, 0);

    let snapshot = fixture.allocator.snapshot().unwrap();
    assert_eq!(snapshot.segments.len(), 1);
    assert_eq!(snapshot.segments[0].blocks.len(), 1);
    assert_eq!(snapshot.segments[0].blocks[0].size, SMALL_BUFFER);
    assert_eq!(fixture.allocator.cache_info(0).unwrap(), (SMALL_BUFFER, SMALL_BUFFER));
}

#[test]
fn test_cross_stream_free_waits_for_recorded_stream() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let owner = fixture.default_stream(0);
    let user = fixture.pool_stream(0, false);

    let ptr = fixture.allocator.raw_alloc_with_stream(4 * KIB, &owner).unwrap();
    fixture.allocator.record_stream(ptr, &user).unwrap();
    fixture.driver.launch_work(user.native()).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();

    // Still pending: the next allocation must not get the same block.
    let other = fixture.allocator.raw_alloc_with_stream(4 * KIB, &owner).unwrap();
    assert_ne!(other, ptr);
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.allocation.all.current, 1);
    assert_eq!(stats.active.all.current, 2);
    let pending = fixture
        .allocator
        .snapshot()
        .unwrap()
        .blocks()
        .filter(|(_, block)| block.state == BlockState::ActivePendingFree)
        .count();
    assert_eq!(pending, 1);

    // Once the recorded stream drains, the block is reclaimed on the next call.
    fixture.driver.complete_work(user.native()).unwrap();
    let reused = fixture.allocator.raw_alloc_with_stream(4 * KIB, &owner).unwrap();
    assert_eq!(reused, ptr);
    assert_eq!(fixture.allocator.device_stats(0).unwrap().active.all.current, 2);

    fixture.allocator.raw_delete(reused).unwrap();
    fixture.allocator.raw_delete(other).unwrap();
    fixture.assert_no_leak(0);
}

#[test]
fn test_erase_stream_cancels_deferral() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let owner = fixture.default_stream(0);
    let user = fixture.pool_stream(0, true);

    let ptr = fixture.allocator.raw_alloc_with_stream(4 * KIB, &owner).unwrap();
    fixture.allocator.record_stream(ptr, &user).unwrap();
    fixture.allocator.erase_stream(ptr, &user).unwrap();
    fixture.driver.launch_work(user.native()).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();

    assert_eq!(fixture.driver.events_created().unwrap(), 0);
    assert_eq!(fixture.allocator.device_stats(0).unwrap().active.all.current, 0);
}

#[test]
fn test_empty_cache_waits_for_pending_frees() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let owner = fixture.default_stream(0);
    let user = fixture.pool_stream(0, false);

    let ptr = fixture.allocator.raw_alloc_with_stream(MIB, &owner).unwrap();
    fixture.allocator.record_stream(ptr, &user).unwrap();
    fixture.driver.launch_work(user.native()).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();

    fixture.allocator.empty_cache().unwrap();
    assert_eq!(fixture.driver.live_allocations(0).unwrap(), 0);
    assert_eq!(fixture.driver.pending_work(user.native()).unwrap(), 0);
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.reserved_bytes.all.current, 0);
    assert_eq!(stats.active.all.current, 0);
}

#[test]
fn test_memory_fraction_budget_fails_without_native_call() {
    let fixture = SimFixture::new(1, 16 * MIB);
    let stream = fixture.default_stream(0);
    fixture.allocator.set_memory_fraction(0.25, 0).unwrap();

    let err = fixture
        .allocator
        .raw_alloc_with_stream(4 * MIB, &stream)
        .unwrap_err();
    let report = err.oom_report().expect("allocator out-of-memory");
    assert_eq!(report.requested, LARGE_BUFFER);
    assert_eq!(report.allowed, Some(4 * MIB));
    assert_eq!(fixture.malloc_calls(0), 0);

    // Small requests still fit the budget.
    let small = fixture.allocator.raw_alloc_with_stream(4 * KIB, &stream).unwrap();
    assert_eq!(fixture.malloc_calls(0), 1);
    fixture.allocator.raw_delete(small).unwrap();
}

#[test]
fn test_native_oom_is_retried_once() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);
    fixture.driver.inject_malloc_failures(1).unwrap();

    let ptr = fixture.allocator.raw_alloc_with_stream(4 * KIB, &stream).unwrap();
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.num_alloc_retries, 1);
    assert_eq!(stats.num_ooms, 0);
    assert_eq!(fixture.malloc_calls(0), 2);
    fixture.allocator.raw_delete(ptr).unwrap();
}

#[test]
fn test_oom_observer_sees_failure() {
    let fixture = SimFixture::new(1, 8 * MIB);
    let stream = fixture.default_stream(0);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    fixture
        .allocator
        .attach_out_of_memory_observer(Arc::new(
            move |device: DeviceIndex, requested: usize, allocated: usize, free: usize| {
                assert_eq!(device, 0);
                assert_eq!(requested, 32 * MIB);
                assert_eq!(allocated, 0);
                assert_eq!(free, 8 * MIB);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ))
        .unwrap();

    let err = fixture
        .allocator
        .raw_alloc_with_stream(32 * MIB, &stream)
        .unwrap_err();
    assert!(matches!(err, NpuForgeError::OutOfMemory(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.allocator.device_stats(0).unwrap().num_ooms, 1);
}

#[test]
fn test_max_split_size_keeps_oversize_blocks_whole() {
    let config = AllocatorConfig::new().with_max_split_size_mb(32);
    let fixture = SimFixture::with_config(1, 256 * MIB, config);
    let stream = fixture.default_stream(0);

    let big = fixture.allocator.raw_alloc_with_stream(40 * MIB, &stream).unwrap();
    fixture.allocator.raw_delete(big).unwrap();

    // Too small for the cached oversize block: a fresh segment is needed.
    let small = fixture.allocator.raw_alloc_with_stream(12 * MIB, &stream).unwrap();
    assert_ne!(small, big);
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.oversize_segments.current, 1);
    assert_eq!(stats.max_split_size, 32 * MIB);
    fixture.allocator.raw_delete(small).unwrap();
    fixture.assert_no_leak(0);
}

#[test]
fn test_history_ring_is_bounded() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);
    fixture
        .allocator
        .record_history(true, Some(Arc::new(|| "test-frame".to_string())), 3, RecordContext::All)
        .unwrap();

    let ptr = fixture.allocator.raw_alloc_with_stream(4 * KIB, &stream).unwrap();
    fixture.allocator.raw_delete(ptr).unwrap();

    // segment_alloc, alloc, free_requested, free_completed: the oldest falls out.
    let history = fixture.allocator.history(0).unwrap();
    let actions: Vec<_> = history.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        vec![TraceAction::Alloc, TraceAction::FreeRequested, TraceAction::FreeCompleted]
    );
    assert_eq!(history[0].context.as_deref(), Some("test-frame"));

    fixture
        .allocator
        .record_history(false, None, 3, RecordContext::Never)
        .unwrap();
    assert!(fixture.allocator.history(0).unwrap().is_empty());
}

#[test]
fn test_snapshot_serializes() {
    let fixture = SimFixture::new(2, 64 * MIB);
    let ptr = fixture
        .allocator
        .raw_alloc_with_stream(5 * MIB, &fixture.default_stream(1))
        .unwrap();
    let snapshot = fixture.allocator.snapshot().unwrap();
    assert_eq!(snapshot.segments_for(1).count(), 1);
    assert_eq!(snapshot.segments_for(0).count(), 0);

    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(json["segments"][0]["device"], 1);
    assert_eq!(json["segments"][0]["blocks"][0]["state"], "active_allocated");
    fixture.allocator.raw_delete(ptr).unwrap();
}

#[test]
fn test_reset_stats() {
    let fixture = SimFixture::new(1, 64 * MIB);
    let stream = fixture.default_stream(0);
    let a = fixture.allocator.raw_alloc_with_stream(8 * KIB, &stream).unwrap();
    let b = fixture.allocator.raw_alloc_with_stream(8 * KIB, &stream).unwrap();
    fixture.allocator.raw_delete(a).unwrap();

    fixture.allocator.reset_peak_stats(0).unwrap();
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.allocated_bytes.all.peak, stats.allocated_bytes.all.current);

    fixture.allocator.reset_accumulated_stats(0).unwrap();
    let stats = fixture.allocator.device_stats(0).unwrap();
    assert_eq!(stats.allocation.all.allocated, 0);
    assert_eq!(stats.allocation.all.freed, 0);
    assert_eq!(stats.allocation.all.current, 1);
    fixture.allocator.raw_delete(b).unwrap();
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prop_oneof![1usize..4096, 4096usize..(2 * MIB), (2 * MIB)..(24 * MIB)].prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_stats_match_snapshot(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let fixture = SimFixture::new(1, 2048 * MIB);
        let stream = fixture.default_stream(0);
        let mut live = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    live.push(fixture.allocator.raw_alloc_with_stream(size, &stream).unwrap());
                }
                Op::Free(pick) if !live.is_empty() => {
                    let ptr = live.swap_remove(pick % live.len());
                    fixture.allocator.raw_delete(ptr).unwrap();
                }
                Op::Free(_) => {}
            }

            let stats = fixture.allocator.device_stats(0).unwrap();
            let snapshot = fixture.allocator.snapshot().unwrap();
            let reserved: usize = snapshot.segments.iter().map(|s| s.total_size).sum();
            let allocated: usize = snapshot.segments.iter().map(|s| s.allocated_size).sum();

            prop_assert_eq!(stats.reserved_bytes.all.current as usize, reserved);
            prop_assert_eq!(stats.allocated_bytes.all.current as usize, allocated);
            prop_assert_eq!(stats.allocation.all.current as usize, live.len());
            prop_assert_eq!(stats.segment.all.current as usize, snapshot.segments.len());
            prop_assert!(stats.allocated_bytes.all.current <= stats.active_bytes.all.current);
            prop_assert!(
                stats.active_bytes.all.current + stats.inactive_split_bytes.all.current
                    <= stats.reserved_bytes.all.current
            );
            prop_assert_eq!(
                stats.reserved_bytes.all.current,
                stats.reserved_bytes.small_pool.current + stats.reserved_bytes.large_pool.current
            );
            prop_assert_eq!(fixture.driver.used_memory(0).unwrap(), reserved);

            for (pool, stat_type) in [
                (BlockPool::Small, StatType::SmallPool),
                (BlockPool::Large, StatType::LargePool),
            ] {
                let segments: Vec<_> = snapshot
                    .segments
                    .iter()
                    .filter(|s| s.segment_type == pool)
                    .collect();
                let live_bytes: usize = segments
                    .iter()
                    .flat_map(|s| s.blocks.iter())
                    .filter(|b| b.state == BlockState::ActiveAllocated)
                    .map(|b| b.size)
                    .sum();
                let pool_reserved: usize = segments.iter().map(|s| s.total_size).sum();
                prop_assert_eq!(stats.allocated_bytes.get(stat_type).current as usize, live_bytes);
                prop_assert_eq!(stats.reserved_bytes.get(stat_type).current as usize, pool_reserved);
            }
        }

        for ptr in live.drain(..) {
            fixture.allocator.raw_delete(ptr).unwrap();
        }
        fixture.allocator.empty_cache().unwrap();
        let stats = fixture.allocator.device_stats(0).unwrap();
        prop_assert_eq!(stats.reserved_bytes.all.current, 0);
        prop_assert_eq!(stats.inactive_split.all.current, 0);
        prop_assert_eq!(fixture.driver.live_allocations(0).unwrap(), 0);
    }
}
