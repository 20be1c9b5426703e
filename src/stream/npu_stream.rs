//! NPU stream value type and its id encoding
//!
//! A stream is identified by `(id, device index, device type)`. Ids encode
//! where the native handle lives:
//!
//! - `0` is the device's default stream
//! - odd ids are pool streams: `(index << 4) | (class << 1) | 1`
//! - even non-zero ids are external streams; the id is the native handle
//!   address, which is always at least 2-byte aligned

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::backend::acl_backend::{DeviceIndex, NativeStream};
use crate::device::{Device, DeviceGuard, DeviceRegistry, DeviceType};
use crate::error::ForgeResult;

pub type StreamId = i64;

pub(crate) const STREAM_INDEX_SHIFT: u32 = 4;
const STREAM_CLASS_MASK: i64 = 0x7;

/// Priority class of a pool stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum StreamClass {
    Low = 0,
    High = 1,
}

/// Where a stream comes from, decoded from its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Default,
    Pool { class: StreamClass, index: usize },
    External,
}

impl StreamKind {
    /// Decode a stream id; `None` if it cannot name a stream.
    pub fn from_id(id: StreamId) -> Option<Self> {
        if id == 0 {
            return Some(StreamKind::Default);
        }
        if id & 1 == 0 {
            return Some(StreamKind::External);
        }
        if id < 0 {
            return None;
        }
        let class = match (id >> 1) & STREAM_CLASS_MASK {
            0 => StreamClass::Low,
            1 => StreamClass::High,
            _ => return None,
        };
        Some(StreamKind::Pool {
            class,
            index: (id >> STREAM_INDEX_SHIFT) as usize,
        })
    }

    pub(crate) fn pool_id(class: StreamClass, index: usize) -> StreamId {
        ((index as i64) << STREAM_INDEX_SHIFT) | ((class as i64) << 1) | 1
    }
}

/// Framework-facing stream reference: three plain integers, no native handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct StreamData3 {
    pub stream_id: StreamId,
    pub device_index: DeviceIndex,
    pub device_type: i8,
}

/// One native queue on one device.
///
/// Cloning is cheap and never creates or destroys native resources; pool
/// streams live until [`super::StreamPool::destroy_all_streams`].
#[derive(Clone)]
pub struct NpuStream {
    id: StreamId,
    device: DeviceIndex,
    native: NativeStream,
    registry: Arc<DeviceRegistry>,
}

impl NpuStream {
    pub(crate) fn new(
        id: StreamId,
        device: DeviceIndex,
        native: NativeStream,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        NpuStream {
            id,
            device,
            native,
            registry,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.device
    }

    pub fn device(&self) -> Device {
        Device::npu(self.device)
    }

    pub fn native(&self) -> NativeStream {
        self.native
    }

    pub fn kind(&self) -> StreamKind {
        // Ids are only assigned through the pool, which never builds an invalid one.
        StreamKind::from_id(self.id).unwrap_or(StreamKind::External)
    }

    /// True once all work submitted so far has finished. Never blocks.
    pub fn query(&self) -> ForgeResult<bool> {
        let _guard = DeviceGuard::new(&self.registry, self.device)?;
        Ok(self.registry.driver().query_stream(self.native)?.is_complete())
    }

    /// Block until all submitted work has finished, or `timeout` elapses.
    pub fn synchronize(&self, timeout: Option<Duration>) -> ForgeResult<()> {
        self.registry.warn_or_error_on_sync()?;
        let _guard = DeviceGuard::new(&self.registry, self.device)?;
        tracing::trace!("Synchronizing stream {:?} (timeout {:?})", self, timeout);
        self.registry
            .driver()
            .synchronize_stream(self.native, timeout)?;
        Ok(())
    }

    pub fn pack3(&self) -> StreamData3 {
        StreamData3 {
            stream_id: self.id,
            device_index: self.device,
            device_type: DeviceType::Npu.tag(),
        }
    }
}

impl PartialEq for NpuStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.device == other.device
    }
}

impl Eq for NpuStream {}

impl Hash for NpuStream {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.device.hash(state);
        DeviceType::Npu.hash(state);
    }
}

impl fmt::Debug for NpuStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpuStream")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("native", &self.native)
            .finish()
    }
}

impl fmt::Display for NpuStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} on device npu:{}", self.id, self.device)
    }
}
