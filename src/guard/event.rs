//! Owned event built on a [`DeviceGuardImpl`]

use std::fmt;
use std::sync::Arc;

use crate::backend::acl_backend::{DeviceIndex, NativeEvent, EVENT_FLAG_SYNC};
use crate::error::ForgeResult;
use crate::guard::npu_guard::DeviceGuardImpl;
use crate::stream::StreamData3;

/// An event whose native handle is created on the first `record` and
/// destroyed when the `NpuEvent` is dropped.
pub struct NpuEvent {
    adapter: Arc<dyn DeviceGuardImpl>,
    event: Option<NativeEvent>,
    device_index: DeviceIndex,
    flags: u32,
    was_recorded: bool,
}

impl NpuEvent {
    pub fn new(adapter: Arc<dyn DeviceGuardImpl>) -> Self {
        Self::with_flags(adapter, EVENT_FLAG_SYNC)
    }

    pub fn with_flags(adapter: Arc<dyn DeviceGuardImpl>, flags: u32) -> Self {
        NpuEvent {
            adapter,
            event: None,
            device_index: -1,
            flags,
            was_recorded: false,
        }
    }

    /// Device of the last recording stream, `-1` before the first record.
    pub fn device_index(&self) -> DeviceIndex {
        self.device_index
    }

    pub fn is_created(&self) -> bool {
        self.event.is_some()
    }

    pub fn was_recorded(&self) -> bool {
        self.was_recorded
    }

    pub fn native(&self) -> Option<NativeEvent> {
        self.event
    }

    /// Capture the work queued on `stream` so far.
    pub fn record(&mut self, stream: StreamData3) -> ForgeResult<()> {
        self.adapter
            .record(&mut self.event, stream, self.device_index, self.flags)?;
        self.device_index = stream.device_index;
        self.was_recorded = true;
        Ok(())
    }

    /// Make `stream` wait until the recorded work completes.
    pub fn block(&self, stream: StreamData3) -> ForgeResult<()> {
        if !self.was_recorded {
            return Ok(());
        }
        self.adapter.block(self.event, stream)
    }

    pub fn query(&self) -> ForgeResult<bool> {
        if !self.was_recorded {
            return Ok(true);
        }
        self.adapter.query_event(self.event)
    }

    pub fn synchronize(&self) -> ForgeResult<()> {
        if !self.was_recorded {
            return Ok(());
        }
        self.adapter.synchronize_event(self.event)
    }

    /// Destroy the native event now. A later `record` creates a new one.
    pub fn destroy(&mut self) {
        if let Some(event) = self.event.take() {
            self.adapter.destroy_event(Some(event), self.device_index);
        }
        self.was_recorded = false;
    }
}

impl fmt::Debug for NpuEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpuEvent")
            .field("event", &self.event)
            .field("device_index", &self.device_index)
            .field("was_recorded", &self.was_recorded)
            .finish()
    }
}

impl Drop for NpuEvent {
    fn drop(&mut self) {
        self.destroy();
    }
}
