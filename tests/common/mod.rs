//! Common test utilities for the simulated NPU
//!
//! Every fixture owns its own [`SimDriver`], so tests do not share device
//! state. Only tests touching process-wide state (the installed runtime,
//! environment variables) need `#[serial]`.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::SimFixture;
//!
//! #[test]
//! fn my_allocator_test() {
//!     let fixture = SimFixture::new(1, 64 * MIB);
//!     let stream = fixture.default_stream(0);
//!     // ... test code ...
//!     fixture.assert_no_leak(0);
//! }
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use npuforge::allocator::{AllocatorConfig, NpuAllocator};
use npuforge::backend::acl_backend::DeviceIndex;
use npuforge::{DeviceRegistry, NpuCachingAllocator, NpuStream, SimDriver, StreamPool};
pub use serial_test::serial;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Registry, stream pools and an initialized caching allocator over a
/// fresh simulated driver.
pub struct SimFixture {
    pub driver: Arc<SimDriver>,
    pub registry: Arc<DeviceRegistry>,
    pub streams: Arc<StreamPool>,
    pub allocator: Arc<NpuCachingAllocator>,
}

impl SimFixture {
    pub fn new(devices: usize, memory_per_device: usize) -> Self {
        Self::with_config(devices, memory_per_device, AllocatorConfig::default())
    }

    pub fn with_config(devices: usize, memory_per_device: usize, config: AllocatorConfig) -> Self {
        let driver = Arc::new(SimDriver::new(devices, memory_per_device));
        let registry = Arc::new(DeviceRegistry::new(driver.clone()));
        let streams = Arc::new(StreamPool::new(registry.clone()));
        let allocator = Arc::new(NpuCachingAllocator::new(
            registry.clone(),
            streams.clone(),
            config,
        ));
        allocator
            .init(registry.device_count())
            .expect("caching allocator init");
        SimFixture {
            driver,
            registry,
            streams,
            allocator,
        }
    }

    pub fn default_stream(&self, device: DeviceIndex) -> NpuStream {
        self.streams
            .default_stream(Some(device))
            .expect("default stream")
    }

    pub fn pool_stream(&self, device: DeviceIndex, high_priority: bool) -> NpuStream {
        self.streams
            .stream_from_pool(high_priority, Some(device))
            .expect("pool stream")
    }

    pub fn malloc_calls(&self, device: DeviceIndex) -> usize {
        self.driver.malloc_calls(device).expect("malloc_calls")
    }

    /// Empty the cache and check that no native allocation is left behind
    /// beyond `expected_live`.
    pub fn assert_no_leak(&self, expected_live: usize) {
        self.allocator.empty_cache().expect("empty_cache");
        for device in 0..self.registry.device_count() {
            let live = self.driver.live_allocations(device).expect("live_allocations");
            assert_eq!(
                live, expected_live,
                "device {} still holds {} native allocation(s)",
                device, live
            );
        }
    }
}
