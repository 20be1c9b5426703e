//! Allocator interface shared by the native caching allocator and pluggable
//! allocators

use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::allocator::snapshot::SnapshotInfo;
use crate::allocator::stats::DeviceStats;
use crate::allocator::trace::{ContextRecorder, RecordContext};
use crate::backend::acl_backend::{DeviceIndex, DevicePtr};
use crate::error::{ForgeResult, NpuForgeError};
use crate::stream::NpuStream;

/// Called after an allocation fails with
/// `(device, requested, allocated bytes, free device bytes)`.
pub type OutOfMemoryObserver = Arc<dyn Fn(DeviceIndex, usize, usize, usize) + Send + Sync>;

static FREE_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Process-wide mutex for callers that must serialize frees against
/// operations like event recording. The allocators never take it.
pub fn free_mutex() -> &'static Mutex<()> {
    &FREE_MUTEX
}

/// A device memory allocator.
///
/// Methods take `&self`; implementations synchronize internally.
pub trait NpuAllocator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare per-device state for `device_count` devices.
    fn init(&self, device_count: DeviceIndex) -> ForgeResult<()>;

    fn initialized(&self) -> bool;

    /// Allocate on the current stream of the current device.
    fn raw_alloc(&self, size: usize) -> ForgeResult<DevicePtr>;

    fn raw_alloc_with_stream(&self, size: usize, stream: &NpuStream) -> ForgeResult<DevicePtr>;

    /// Free a pointer returned by this allocator. Null is ignored.
    fn raw_delete(&self, ptr: DevicePtr) -> ForgeResult<()>;

    fn empty_cache(&self) -> ForgeResult<()>;

    fn empty_device_cache(&self, device: DeviceIndex) -> ForgeResult<()>;

    /// Limit `device` to `fraction` (0.0..=1.0) of its total memory.
    fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> ForgeResult<()>;

    /// `(cached bytes, largest cached block)` of `device`.
    fn cache_info(&self, device: DeviceIndex) -> ForgeResult<(usize, usize)>;

    /// Base address and size of the native allocation holding `ptr`.
    fn get_base_allocation(&self, ptr: DevicePtr) -> ForgeResult<(DevicePtr, usize)>;

    /// Mark `ptr` as used by `stream`; its memory will not be reused before
    /// work queued on `stream` at free time completes.
    fn record_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()>;

    fn erase_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()>;

    fn device_stats(&self, device: DeviceIndex) -> ForgeResult<DeviceStats>;

    fn reset_accumulated_stats(&self, device: DeviceIndex) -> ForgeResult<()>;

    fn reset_peak_stats(&self, device: DeviceIndex) -> ForgeResult<()>;

    fn snapshot(&self) -> ForgeResult<SnapshotInfo>;

    fn record_history(
        &self,
        enabled: bool,
        recorder: Option<ContextRecorder>,
        max_entries: usize,
        when: RecordContext,
    ) -> ForgeResult<()>;

    fn attach_out_of_memory_observer(&self, observer: OutOfMemoryObserver) -> ForgeResult<()>;
}

pub(crate) fn check_memory_fraction(fraction: f64) -> ForgeResult<()> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(NpuForgeError::InvalidArgument(format!(
            "memory fraction {} is outside [0, 1]",
            fraction
        )));
    }
    Ok(())
}

/// Owned device allocation, returned to its allocator on drop.
pub struct DataPtr {
    ptr: DevicePtr,
    size: usize,
    device: DeviceIndex,
    allocator: Arc<dyn NpuAllocator>,
}

impl DataPtr {
    pub fn new(ptr: DevicePtr, size: usize, device: DeviceIndex, allocator: Arc<dyn NpuAllocator>) -> Self {
        DataPtr {
            ptr,
            size,
            device,
            allocator,
        }
    }

    pub fn get(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn allocator(&self) -> &Arc<dyn NpuAllocator> {
        &self.allocator
    }

    /// Give up ownership without freeing.
    pub fn release(mut self) -> DevicePtr {
        std::mem::replace(&mut self.ptr, DevicePtr::null())
    }
}

impl fmt::Debug for DataPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPtr")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("device", &self.device)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

impl Drop for DataPtr {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        if let Err(err) = self.allocator.raw_delete(self.ptr) {
            tracing::warn!("Failed to free {} on device {}: {}", self.ptr, self.device, err);
        }
    }
}
