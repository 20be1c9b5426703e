//! Device backend capability set exposed to host frameworks

use std::sync::Arc;

use crate::backend::acl_backend::{check_warn, DeviceIndex, NativeEvent};
use crate::device::{Device, DeviceGuard, DeviceRegistry, DeviceType};
use crate::error::{ForgeResult, NpuForgeError};
use crate::precondition_error;
use crate::stream::{NpuStream, StreamData3, StreamPool};

/// Device and event operations a host framework dispatches to a backend.
///
/// Streams cross this boundary only in their packed [`StreamData3`] form.
/// Event handles are `Option`s; `None` is an event that was never created.
pub trait DeviceGuardImpl: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Activate `device` and return the previously active one.
    fn exchange_device(&self, device: Device) -> ForgeResult<Device>;

    fn get_device(&self) -> ForgeResult<Device>;

    fn set_device(&self, device: Device) -> ForgeResult<()>;

    /// Like `set_device`, but failures are logged instead of returned.
    fn unchecked_set_device(&self, device: Device);

    /// Current stream of the calling thread on `device`.
    fn get_stream(&self, device: Device) -> ForgeResult<StreamData3>;

    fn get_default_stream(&self, device: Device) -> ForgeResult<StreamData3>;

    fn get_stream_from_global_pool(&self, device: Device, high_priority: bool) -> ForgeResult<StreamData3>;

    /// Make `stream` current on its device and return the previous current
    /// stream. The active device is not changed.
    fn exchange_stream(&self, stream: StreamData3) -> ForgeResult<StreamData3>;

    fn device_count(&self) -> DeviceIndex;

    /// Record `event` on `stream`, creating it with `flags` if needed.
    ///
    /// `device_index` is the device the event belongs to, or `-1` if it has
    /// none yet; it must match the stream's device.
    fn record(
        &self,
        event: &mut Option<NativeEvent>,
        stream: StreamData3,
        device_index: DeviceIndex,
        flags: u32,
    ) -> ForgeResult<()>;

    /// Make `stream` wait for `event`. A missing event is a no-op.
    fn block(&self, event: Option<NativeEvent>, stream: StreamData3) -> ForgeResult<()>;

    /// Whether the work captured by `event` has completed. A missing event
    /// is complete.
    fn query_event(&self, event: Option<NativeEvent>) -> ForgeResult<bool>;

    fn synchronize_event(&self, event: Option<NativeEvent>) -> ForgeResult<()>;

    /// Destroy `event` on `device_index`. Failures are logged.
    fn destroy_event(&self, event: Option<NativeEvent>, device_index: DeviceIndex);

    fn query_stream(&self, stream: StreamData3) -> ForgeResult<bool>;

    fn synchronize_stream(&self, stream: StreamData3) -> ForgeResult<()>;
}

/// [`DeviceGuardImpl`] for the NPU: every call goes straight to the
/// registry, the stream pools or the driver.
#[derive(Debug, Clone)]
pub struct NpuGuardImpl {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamPool>,
}

impl NpuGuardImpl {
    pub fn new(streams: Arc<StreamPool>) -> Self {
        NpuGuardImpl {
            registry: streams.registry().clone(),
            streams,
        }
    }

    fn check_type(device: Device) -> ForgeResult<DeviceIndex> {
        if device.device_type != DeviceType::Npu {
            return Err(NpuForgeError::InvalidArgument(format!(
                "expected an NPU device, got {:?}",
                device.device_type
            )));
        }
        Ok(device.index)
    }

    fn stream(&self, data: StreamData3) -> ForgeResult<NpuStream> {
        self.streams.unpack3(data)
    }
}

impl DeviceGuardImpl for NpuGuardImpl {
    fn device_type(&self) -> DeviceType {
        DeviceType::Npu
    }

    fn exchange_device(&self, device: Device) -> ForgeResult<Device> {
        let index = Self::check_type(device)?;
        Ok(Device::npu(self.registry.exchange_device(index)?))
    }

    fn get_device(&self) -> ForgeResult<Device> {
        Ok(Device::npu(self.registry.current_device()?))
    }

    fn set_device(&self, device: Device) -> ForgeResult<()> {
        self.registry.set_device(Self::check_type(device)?)
    }

    fn unchecked_set_device(&self, device: Device) {
        self.registry.unchecked_set_device(device.index);
    }

    fn get_stream(&self, device: Device) -> ForgeResult<StreamData3> {
        let index = Self::check_type(device)?;
        Ok(self.streams.current_stream(Some(index))?.pack3())
    }

    fn get_default_stream(&self, device: Device) -> ForgeResult<StreamData3> {
        let index = Self::check_type(device)?;
        Ok(self.streams.default_stream(Some(index))?.pack3())
    }

    fn get_stream_from_global_pool(&self, device: Device, high_priority: bool) -> ForgeResult<StreamData3> {
        let index = Self::check_type(device)?;
        Ok(self.streams.stream_from_pool(high_priority, Some(index))?.pack3())
    }

    fn exchange_stream(&self, stream: StreamData3) -> ForgeResult<StreamData3> {
        let stream = self.stream(stream)?;
        let previous = self.streams.current_stream(Some(stream.device_index()))?;
        self.streams.set_current_stream(&stream);
        Ok(previous.pack3())
    }

    fn device_count(&self) -> DeviceIndex {
        self.registry.device_count()
    }

    fn record(
        &self,
        event: &mut Option<NativeEvent>,
        stream: StreamData3,
        device_index: DeviceIndex,
        flags: u32,
    ) -> ForgeResult<()> {
        if device_index != -1 && device_index != stream.device_index {
            return Err(precondition_error!(
                "event device index {} does not match recording stream's device index {}",
                device_index,
                stream.device_index
            ));
        }
        let stream = self.stream(stream)?;
        let _guard = DeviceGuard::new(&self.registry, stream.device_index())?;
        let driver = self.registry.driver();
        let native = match *event {
            Some(native) => native,
            None => {
                let created = driver.create_event(flags)?;
                *event = Some(created);
                created
            }
        };
        driver.record_event(native, stream.native())?;
        Ok(())
    }

    fn block(&self, event: Option<NativeEvent>, stream: StreamData3) -> ForgeResult<()> {
        let Some(event) = event else {
            return Ok(());
        };
        let stream = self.stream(stream)?;
        let _guard = DeviceGuard::new(&self.registry, stream.device_index())?;
        self.registry.driver().stream_wait_event(stream.native(), event)?;
        Ok(())
    }

    fn query_event(&self, event: Option<NativeEvent>) -> ForgeResult<bool> {
        let Some(event) = event else {
            return Ok(true);
        };
        Ok(self.registry.driver().query_event(event)?.is_complete())
    }

    fn synchronize_event(&self, event: Option<NativeEvent>) -> ForgeResult<()> {
        let Some(event) = event else {
            return Ok(());
        };
        self.registry.warn_or_error_on_sync()?;
        self.registry.driver().synchronize_event(event)?;
        Ok(())
    }

    fn destroy_event(&self, event: Option<NativeEvent>, device_index: DeviceIndex) {
        let Some(event) = event else {
            return;
        };
        let _guard = match DeviceGuard::new(&self.registry, device_index) {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::warn!("Could not activate device {} to destroy an event: {}", device_index, err);
                None
            }
        };
        check_warn(self.registry.driver().destroy_event(event), "destroying event");
    }

    fn query_stream(&self, stream: StreamData3) -> ForgeResult<bool> {
        self.stream(stream)?.query()
    }

    fn synchronize_stream(&self, stream: StreamData3) -> ForgeResult<()> {
        self.stream(stream)?.synchronize(None)
    }
}
