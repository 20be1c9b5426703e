//! Device registry: lazy default device, guards, reset and sync debugging

mod common;

use std::sync::Arc;

use common::MIB;
use npuforge::backend::acl_backend::error::ACL_ERROR_RT_PARAM_INVALID;
use npuforge::{DeviceGuard, DeviceRegistry, NpuForgeError, SimDriver, StreamPool, SyncDebugMode};

fn registry(devices: usize) -> (Arc<SimDriver>, Arc<DeviceRegistry>) {
    let driver = Arc::new(SimDriver::new(devices, 64 * MIB));
    let registry = Arc::new(DeviceRegistry::new(driver.clone()));
    (driver, registry)
}

#[test]
fn test_query_never_fails_for_lack_of_activation() {
    let (driver, registry) = registry(4);
    assert_eq!(registry.device_count(), 4);
    assert!(registry.used_devices().unwrap().is_empty());

    assert_eq!(registry.current_device().unwrap(), 0);
    assert!(registry.has_primary_context(0));
    assert_eq!(registry.get_context(0).unwrap(), driver.context_of(0).unwrap());
}

#[test]
fn test_device_guard_nesting() {
    let (_driver, registry) = registry(3);
    registry.set_device(0).unwrap();
    {
        let mut outer = DeviceGuard::new(&registry, 1).unwrap();
        assert_eq!(registry.current_device().unwrap(), 1);
        {
            let _inner = DeviceGuard::new(&registry, 2).unwrap();
            assert_eq!(registry.current_device().unwrap(), 2);
        }
        assert_eq!(registry.current_device().unwrap(), 1);
        outer.set_index(2).unwrap();
        assert_eq!(outer.original_device(), 0);
    }
    assert_eq!(registry.current_device().unwrap(), 0);
    assert_eq!(registry.used_devices().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_exchange_device_returns_previous() {
    let (_driver, registry) = registry(2);
    registry.set_device(1).unwrap();
    assert_eq!(registry.exchange_device(0).unwrap(), 1);
    assert_eq!(registry.current_device().unwrap(), 0);
    assert_eq!(registry.exchange_device(0).unwrap(), 0);
}

#[test]
fn test_current_device_is_per_thread() {
    let (_driver, registry) = registry(2);
    registry.set_device(1).unwrap();
    let other = registry.clone();
    let seen = std::thread::spawn(move || other.current_device().unwrap())
        .join()
        .unwrap();
    assert_eq!(seen, 0);
    assert_eq!(registry.current_device().unwrap(), 1);
}

#[test]
fn test_reset_all_partial_failure() {
    let (driver, registry) = registry(3);
    for device in 0..3 {
        registry.set_device(device).unwrap();
    }
    driver.fail_next_reset(1, ACL_ERROR_RT_PARAM_INVALID).unwrap();

    match registry.reset_all() {
        Err(NpuForgeError::PartialReset {
            failed_device,
            reset,
            source,
        }) => {
            assert_eq!(failed_device, 1);
            assert_eq!(reset, vec![0]);
            assert_eq!(source.code(), Some(ACL_ERROR_RT_PARAM_INVALID));
        }
        other => panic!("expected a partial reset, got {:?}", other),
    }
    assert!(!registry.has_primary_context(0));
    assert!(registry.has_primary_context(1));
    assert_eq!(registry.used_devices().unwrap(), vec![1, 2]);

    // The injected failure is one-shot; a second pass finishes the job.
    registry.reset_all().unwrap();
    assert!(registry.used_devices().unwrap().is_empty());
    assert_eq!(driver.reset_calls(0).unwrap(), 1);
    assert_eq!(driver.reset_calls(1).unwrap(), 2);
    assert_eq!(driver.reset_calls(2).unwrap(), 1);
}

#[test]
fn test_device_can_be_reactivated_after_reset() {
    let (driver, registry) = registry(1);
    registry.set_device(0).unwrap();
    let before = registry.get_context(0).unwrap();
    registry.reset_all().unwrap();
    assert_eq!(registry.get_context(0).unwrap(), None);

    registry.set_device(0).unwrap();
    let after = registry.get_context(0).unwrap();
    assert!(after.is_some());
    assert_ne!(after, before);
    assert_eq!(after, driver.context_of(0).unwrap());
}

#[test]
fn test_synchronize_all_restores_device() {
    let (driver, registry) = registry(3);
    let streams = StreamPool::new(registry.clone());
    let s2 = streams.stream_from_pool(false, Some(2)).unwrap();
    driver.launch_work(s2.native()).unwrap();
    registry.set_device(1).unwrap();

    registry.synchronize_all().unwrap();
    assert_eq!(registry.current_device().unwrap(), 1);
    assert_eq!(driver.pending_work(s2.native()).unwrap(), 0);
    assert_eq!(driver.synchronize_calls(2).unwrap(), 1);
}

#[test]
fn test_sync_debug_mode_error_blocks_synchronizing_calls() {
    let (driver, registry) = registry(1);
    let streams = StreamPool::new(registry.clone());
    let stream = streams.default_stream(Some(0)).unwrap();
    driver.launch_work(stream.native()).unwrap();

    registry.set_sync_debug_mode(SyncDebugMode::Error);
    assert!(matches!(
        stream.synchronize(None),
        Err(NpuForgeError::SyncDebugViolation(_))
    ));
    assert!(matches!(
        registry.synchronize_all(),
        Err(NpuForgeError::SyncDebugViolation(_))
    ));
    assert_eq!(driver.pending_work(stream.native()).unwrap(), 1);
    // Non-blocking queries are unaffected.
    assert!(!stream.query().unwrap());

    registry.set_sync_debug_mode(SyncDebugMode::Warn);
    stream.synchronize(None).unwrap();
    assert_eq!(registry.sync_debug_mode().as_level(), 1);
    assert_eq!(driver.pending_work(stream.native()).unwrap(), 0);
}

#[test]
fn test_mem_get_info_and_properties() {
    let (_driver, registry) = registry(2);
    let info = registry.mem_get_info(1).unwrap();
    assert_eq!(info.total, 64 * MIB);
    assert_eq!(info.free, 64 * MIB);
    assert_eq!(registry.device_properties(1).unwrap().name, "SimNPU-1");
    assert!(matches!(
        registry.mem_get_info(5),
        Err(NpuForgeError::InvalidDevice { index: 5, count: 2 })
    ));
}
