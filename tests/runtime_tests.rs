//! Runtime: allocator slot, owned allocations, pluggable allocator, shutdown

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{serial, KIB, MIB};
use npuforge::allocator::pluggable::{AllocFn, FreeFn};
use npuforge::backend::acl_backend::{DeviceIndex, DevicePtr, NativeStream};
use npuforge::{
    AllocatorConfig, NpuAllocator, NpuForgeError, NpuRuntime, PluggableAllocator, SimDriver,
};

fn runtime(devices: usize, memory: usize) -> (Arc<SimDriver>, NpuRuntime) {
    let driver = Arc::new(SimDriver::new(devices, memory));
    let runtime = NpuRuntime::new(driver.clone(), AllocatorConfig::default()).unwrap();
    (driver, runtime)
}

/// Bump allocator over a fake address range that counts its calls.
fn counting_pluggable(runtime: &NpuRuntime, allocs: Arc<AtomicUsize>, frees: Arc<AtomicUsize>) -> PluggableAllocator {
    let next = Arc::new(AtomicUsize::new(0x7000_0000));
    let alloc_fn: AllocFn = Arc::new(move |size: usize, _: DeviceIndex, _: NativeStream| {
        allocs.fetch_add(1, Ordering::SeqCst);
        DevicePtr(next.fetch_add(size.max(1).next_multiple_of(512), Ordering::SeqCst))
    });
    let free_fn: FreeFn = Arc::new(move |_: DevicePtr, _: usize, _: DeviceIndex, _: NativeStream| {
        frees.fetch_add(1, Ordering::SeqCst);
    });
    PluggableAllocator::new(runtime.streams().clone(), alloc_fn, free_fn)
}

#[test]
fn test_allocator_is_initialized_lazily() {
    let (driver, runtime) = runtime(2, 64 * MIB);
    assert!(!runtime.caching_allocator().initialized());

    let ptr = runtime.allocate(4 * KIB).unwrap();
    assert!(runtime.caching_allocator().initialized());
    assert_eq!(ptr.device(), 0);
    assert_eq!(ptr.size(), 4 * KIB);
    assert_eq!(driver.live_allocations(0).unwrap(), 1);
}

#[test]
fn test_data_ptr_frees_on_drop() {
    let (_driver, runtime) = runtime(1, 64 * MIB);
    let stream = runtime.streams().stream_from_pool(false, Some(0)).unwrap();
    let ptr = runtime.allocate_on(MIB, &stream).unwrap();
    assert!(!ptr.get().is_null());
    assert_eq!(
        runtime.caching_allocator().device_stats(0).unwrap().allocation.all.current,
        1
    );
    drop(ptr);
    assert_eq!(
        runtime.caching_allocator().device_stats(0).unwrap().allocation.all.current,
        0
    );
}

#[test]
fn test_released_data_ptr_is_not_freed() {
    let (_driver, runtime) = runtime(1, 64 * MIB);
    let ptr = runtime.allocate(KIB).unwrap();
    let raw = ptr.release();
    let allocator = runtime.current_allocator().unwrap();
    assert_eq!(allocator.device_stats(0).unwrap().allocation.all.current, 1);
    allocator.raw_delete(raw).unwrap();
    assert_eq!(allocator.device_stats(0).unwrap().allocation.all.current, 0);
}

#[test]
fn test_change_allocator_before_first_use() {
    let (driver, runtime) = runtime(1, 64 * MIB);
    let allocs = Arc::new(AtomicUsize::new(0));
    let frees = Arc::new(AtomicUsize::new(0));
    let pluggable = counting_pluggable(&runtime, allocs.clone(), frees.clone());
    runtime.change_current_allocator(Arc::new(pluggable)).unwrap();

    let ptr = runtime.allocate(4 * KIB).unwrap();
    assert_eq!(allocs.load(Ordering::SeqCst), 1);
    assert_eq!(driver.malloc_calls(0).unwrap(), 0);
    assert_eq!(runtime.current_allocator().unwrap().name(), "pluggable");
    drop(ptr);
    assert_eq!(frees.load(Ordering::SeqCst), 1);

    // The pluggable allocator is now initialized and cannot be swapped out.
    let replacement = counting_pluggable(&runtime, allocs, frees);
    assert!(matches!(
        runtime.change_current_allocator(Arc::new(replacement)),
        Err(NpuForgeError::PreconditionFailed(_))
    ));
}

#[test]
fn test_change_allocator_refused_after_native_use() {
    let (_driver, runtime) = runtime(1, 64 * MIB);
    let _ptr = runtime.allocate(KIB).unwrap();
    let pluggable = counting_pluggable(
        &runtime,
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    );
    assert!(matches!(
        runtime.change_current_allocator(Arc::new(pluggable)),
        Err(NpuForgeError::PreconditionFailed(_))
    ));
    assert_eq!(runtime.current_allocator().unwrap().name(), "native");
}

#[test]
fn test_pluggable_record_stream_and_snapshot() {
    let (_driver, runtime) = runtime(1, 64 * MIB);
    let pluggable = Arc::new(counting_pluggable(
        &runtime,
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ));
    runtime.change_current_allocator(pluggable.clone()).unwrap();

    let owner = runtime.streams().default_stream(Some(0)).unwrap();
    let user = runtime.streams().stream_from_pool(true, Some(0)).unwrap();
    let ptr = runtime.allocate_on(3 * MIB, &owner).unwrap();
    pluggable.record_stream(ptr.get(), &user).unwrap();
    pluggable.record_stream(ptr.get(), &owner).unwrap();
    assert_eq!(pluggable.recorded_streams(ptr.get()).unwrap(), vec![user]);

    let snapshot = pluggable.snapshot().unwrap();
    assert_eq!(snapshot.segments.len(), 1);
    assert_eq!(snapshot.segments[0].total_size, 3 * MIB);
    assert!(matches!(
        pluggable.cache_info(0),
        Err(NpuForgeError::Unsupported(_))
    ));
    drop(ptr);
    assert_eq!(pluggable.live_allocations().unwrap(), 0);
}

#[test]
fn test_out_of_memory_through_runtime() {
    let (_driver, runtime) = runtime(1, 4 * MIB);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    runtime
        .current_allocator()
        .unwrap()
        .attach_out_of_memory_observer(Arc::new(
            move |_: DeviceIndex, _: usize, _: usize, _: usize| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ))
        .unwrap();

    let err = runtime.allocate(16 * MIB).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(err.is_recoverable());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_releases_everything() {
    let (driver, runtime) = runtime(2, 64 * MIB);
    let s0 = runtime.streams().stream_from_pool(false, Some(0)).unwrap();
    let s1 = runtime.streams().stream_from_pool(false, Some(1)).unwrap();
    drop(runtime.allocate_on(MIB, &s0).unwrap());
    drop(runtime.allocate_on(12 * MIB, &s1).unwrap());
    assert_eq!(driver.live_allocations(1).unwrap(), 1);

    runtime.shutdown().unwrap();
    assert_eq!(driver.live_allocations(0).unwrap(), 0);
    assert_eq!(driver.live_allocations(1).unwrap(), 0);
    assert_eq!(driver.live_streams().unwrap(), 0);
    assert_eq!(driver.reset_calls(0).unwrap(), 1);
    assert_eq!(driver.reset_calls(1).unwrap(), 1);
    assert!(runtime.registry().used_devices().unwrap().is_empty());
}

#[test]
fn test_invalid_config_rejected() {
    let driver = Arc::new(SimDriver::new(1, MIB));
    let config = AllocatorConfig::new().with_max_split_size_mb(1);
    assert!(matches!(
        NpuRuntime::new(driver, config),
        Err(NpuForgeError::InvalidConfiguration(_))
    ));
}

#[test]
#[serial]
fn test_install_and_global() {
    assert!(NpuRuntime::global().is_err());

    let driver = Arc::new(SimDriver::new(1, 64 * MIB));
    let installed = NpuRuntime::install(NpuRuntime::new(driver.clone(), AllocatorConfig::default()).unwrap()).unwrap();
    let global = NpuRuntime::global().unwrap();
    assert!(Arc::ptr_eq(&installed, &global));

    let second = NpuRuntime::new(driver, AllocatorConfig::default()).unwrap();
    assert!(matches!(
        NpuRuntime::install(second),
        Err(NpuForgeError::PreconditionFailed(_))
    ));
}
