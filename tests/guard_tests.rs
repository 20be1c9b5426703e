//! Capability adapter and events as a host framework drives them

mod common;

use std::sync::Arc;

use common::{SimFixture, MIB};
use npuforge::device::{Device, DeviceType};
use npuforge::{DeviceGuardImpl, NpuEvent, NpuForgeError, NpuGuardImpl, SyncDebugMode};

fn adapter(fixture: &SimFixture) -> Arc<dyn DeviceGuardImpl> {
    Arc::new(NpuGuardImpl::new(fixture.streams.clone()))
}

#[test]
fn test_adapter_device_calls() {
    let fixture = SimFixture::new(3, MIB);
    let adapter = adapter(&fixture);
    assert_eq!(adapter.device_type(), DeviceType::Npu);
    assert_eq!(adapter.device_count(), 3);

    assert_eq!(adapter.get_device().unwrap(), Device::npu(0));
    assert_eq!(adapter.exchange_device(Device::npu(2)).unwrap(), Device::npu(0));
    assert_eq!(fixture.registry.current_device().unwrap(), 2);

    let cpu = Device {
        device_type: DeviceType::Cpu,
        index: 0,
    };
    assert!(matches!(
        adapter.set_device(cpu),
        Err(NpuForgeError::InvalidArgument(_))
    ));
    assert!(matches!(
        adapter.set_device(Device::npu(7)),
        Err(NpuForgeError::InvalidDevice { index: 7, count: 3 })
    ));
    adapter.unchecked_set_device(Device::npu(1));
    assert_eq!(fixture.registry.current_device().unwrap(), 1);
}

#[test]
fn test_adapter_stream_calls() {
    let fixture = SimFixture::new(2, MIB);
    let adapter = adapter(&fixture);

    let default = adapter.get_default_stream(Device::npu(1)).unwrap();
    assert_eq!(adapter.get_stream(Device::npu(1)).unwrap(), default);

    let pooled = adapter
        .get_stream_from_global_pool(Device::npu(1), true)
        .unwrap();
    assert_eq!(adapter.exchange_stream(pooled).unwrap(), default);
    assert_eq!(adapter.get_stream(Device::npu(1)).unwrap(), pooled);
    // Device 0 keeps its own current stream.
    assert_eq!(
        adapter.get_stream(Device::npu(0)).unwrap(),
        adapter.get_default_stream(Device::npu(0)).unwrap()
    );

    assert!(adapter.query_stream(pooled).unwrap());
    let native = fixture.streams.unpack3(pooled).unwrap().native();
    fixture.driver.launch_work(native).unwrap();
    assert!(!adapter.query_stream(pooled).unwrap());
    adapter.synchronize_stream(pooled).unwrap();
    assert!(adapter.query_stream(pooled).unwrap());
}

#[test]
fn test_event_orders_work_across_streams() {
    let fixture = SimFixture::new(1, MIB);
    let adapter = adapter(&fixture);
    let producer = fixture.pool_stream(0, false);
    let consumer = fixture.pool_stream(0, true);

    let mut event = NpuEvent::new(adapter.clone());
    assert_eq!(event.device_index(), -1);
    assert!(event.query().unwrap());

    fixture.driver.launch_work(producer.native()).unwrap();
    event.record(producer.pack3()).unwrap();
    assert!(event.is_created());
    assert!(event.was_recorded());
    assert_eq!(event.device_index(), 0);
    assert!(!event.query().unwrap());

    event.block(consumer.pack3()).unwrap();
    fixture.driver.complete_work(producer.native()).unwrap();
    assert!(event.query().unwrap());

    // Re-recording reuses the native event.
    let native = event.native();
    fixture.driver.launch_work(producer.native()).unwrap();
    event.record(producer.pack3()).unwrap();
    assert_eq!(event.native(), native);
    event.synchronize().unwrap();
    assert_eq!(fixture.driver.pending_work(producer.native()).unwrap(), 0);

    drop(event);
    assert_eq!(fixture.driver.live_events().unwrap(), 0);
}

#[test]
fn test_event_record_on_other_device_rejected() {
    let fixture = SimFixture::new(2, MIB);
    let adapter = adapter(&fixture);
    let mut event = NpuEvent::new(adapter);

    event.record(fixture.default_stream(0).pack3()).unwrap();
    assert!(matches!(
        event.record(fixture.default_stream(1).pack3()),
        Err(NpuForgeError::PreconditionFailed(_))
    ));
    assert_eq!(event.device_index(), 0);
}

#[test]
fn test_event_synchronize_respects_sync_debug_mode() {
    let fixture = SimFixture::new(1, MIB);
    let adapter = adapter(&fixture);
    let stream = fixture.pool_stream(0, false);
    let mut event = NpuEvent::new(adapter);
    fixture.driver.launch_work(stream.native()).unwrap();
    event.record(stream.pack3()).unwrap();

    fixture.registry.set_sync_debug_mode(SyncDebugMode::Error);
    assert!(matches!(
        event.synchronize(),
        Err(NpuForgeError::SyncDebugViolation(_))
    ));
    assert!(!event.query().unwrap());

    fixture.registry.set_sync_debug_mode(SyncDebugMode::Disabled);
    event.synchronize().unwrap();
    assert!(event.query().unwrap());
}
