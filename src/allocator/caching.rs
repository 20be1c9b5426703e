//! Native caching allocator: one [`DeviceCachingAllocator`] per device plus a
//! table mapping live pointers to their device.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::OnceCell;

use crate::allocator::backend::{check_memory_fraction, NpuAllocator, OutOfMemoryObserver};
use crate::allocator::config::AllocatorConfig;
use crate::allocator::device_allocator::DeviceCachingAllocator;
use crate::allocator::snapshot::SnapshotInfo;
use crate::allocator::stats::DeviceStats;
use crate::allocator::trace::{ContextRecorder, RecordContext, TraceEntry};
use crate::backend::acl_backend::{DeviceIndex, DevicePtr};
use crate::device::DeviceRegistry;
use crate::error::{ForgeResult, NpuForgeError};
use crate::precondition_error;
use crate::stream::{NpuStream, StreamPool};

pub struct NpuCachingAllocator {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamPool>,
    config: AllocatorConfig,
    device_allocators: OnceCell<Vec<DeviceCachingAllocator>>,
    allocated_blocks: Mutex<HashMap<DevicePtr, DeviceIndex>>,
    oom_observers: RwLock<Vec<OutOfMemoryObserver>>,
}

impl std::fmt::Debug for NpuCachingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpuCachingAllocator")
            .field("config", &self.config)
            .field("devices", &self.device_allocators.get().map(Vec::len))
            .finish()
    }
}

impl NpuCachingAllocator {
    pub fn new(registry: Arc<DeviceRegistry>, streams: Arc<StreamPool>, config: AllocatorConfig) -> Self {
        NpuCachingAllocator {
            registry,
            streams,
            config,
            device_allocators: OnceCell::new(),
            allocated_blocks: Mutex::new(HashMap::new()),
            oom_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn allocators(&self) -> ForgeResult<&[DeviceCachingAllocator]> {
        self.device_allocators
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| precondition_error!("caching allocator used before init"))
    }

    fn device_allocator(&self, device: DeviceIndex) -> ForgeResult<&DeviceCachingAllocator> {
        let allocators = self.allocators()?;
        usize::try_from(device)
            .ok()
            .and_then(|index| allocators.get(index))
            .ok_or(NpuForgeError::InvalidDevice {
                index: device,
                count: allocators.len() as DeviceIndex,
            })
    }

    fn notify_oom(&self, err: &NpuForgeError) {
        let Some(report) = err.oom_report() else {
            return;
        };
        let observers = match self.oom_observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer(report.device, report.requested, report.allocated, report.free);
        }
    }

    /// History ring of `device`.
    pub fn history(&self, device: DeviceIndex) -> ForgeResult<Vec<TraceEntry>> {
        self.device_allocator(device)?.history()
    }

    /// Device owning the live allocation `ptr`, if any.
    pub fn owning_device(&self, ptr: DevicePtr) -> ForgeResult<Option<DeviceIndex>> {
        Ok(self.allocated_blocks.lock()?.get(&ptr).copied())
    }

    fn lookup(&self, ptr: DevicePtr) -> ForgeResult<DeviceIndex> {
        self.owning_device(ptr)?.ok_or_else(|| {
            NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
        })
    }
}

impl NpuAllocator for NpuCachingAllocator {
    fn name(&self) -> &'static str {
        "native"
    }

    fn init(&self, device_count: DeviceIndex) -> ForgeResult<()> {
        self.config.validate()?;
        self.device_allocators.get_or_init(|| {
            tracing::debug!("Initializing caching allocator for {} devices", device_count);
            (0..device_count.max(0))
                .map(|device| DeviceCachingAllocator::new(device, self.registry.clone(), self.config.clone()))
                .collect()
        });
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.device_allocators.get().is_some()
    }

    fn raw_alloc(&self, size: usize) -> ForgeResult<DevicePtr> {
        let stream = self.streams.current_stream(None)?;
        self.raw_alloc_with_stream(size, &stream)
    }

    fn raw_alloc_with_stream(&self, size: usize, stream: &NpuStream) -> ForgeResult<DevicePtr> {
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        let device = stream.device_index();
        let ptr = match self.device_allocator(device)?.malloc(size, stream) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.notify_oom(&err);
                return Err(err);
            }
        };
        self.allocated_blocks.lock()?.insert(ptr, device);
        Ok(ptr)
    }

    fn raw_delete(&self, ptr: DevicePtr) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        // Held across the free so the address cannot be handed out and
        // registered again before its entry is removed.
        let mut table = self.allocated_blocks.lock()?;
        let device = table.get(&ptr).copied().ok_or_else(|| {
            NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
        })?;
        self.device_allocator(device)?.free(ptr)?;
        table.remove(&ptr);
        Ok(())
    }

    fn empty_cache(&self) -> ForgeResult<()> {
        let Some(allocators) = self.device_allocators.get() else {
            return Ok(());
        };
        for allocator in allocators {
            allocator.empty_cache()?;
        }
        Ok(())
    }

    fn empty_device_cache(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.device_allocator(device)?.empty_cache()
    }

    fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> ForgeResult<()> {
        check_memory_fraction(fraction)?;
        self.device_allocator(device)?.set_memory_fraction(fraction)
    }

    fn cache_info(&self, device: DeviceIndex) -> ForgeResult<(usize, usize)> {
        self.device_allocator(device)?.cache_info()
    }

    fn get_base_allocation(&self, ptr: DevicePtr) -> ForgeResult<(DevicePtr, usize)> {
        let device = self.lookup(ptr)?;
        self.device_allocator(device)?.get_base_allocation(ptr)
    }

    fn record_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let device = self.lookup(ptr)?;
        self.device_allocator(device)?.record_stream(ptr, stream)
    }

    fn erase_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let device = self.lookup(ptr)?;
        self.device_allocator(device)?.erase_stream(ptr, stream)
    }

    fn device_stats(&self, device: DeviceIndex) -> ForgeResult<DeviceStats> {
        self.device_allocator(device)?.stats()
    }

    fn reset_accumulated_stats(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.device_allocator(device)?.reset_accumulated_stats()
    }

    fn reset_peak_stats(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.device_allocator(device)?.reset_peak_stats()
    }

    fn snapshot(&self) -> ForgeResult<SnapshotInfo> {
        let mut snapshot = SnapshotInfo::default();
        for allocator in self.allocators()? {
            snapshot.segments.extend(allocator.snapshot()?);
            snapshot.device_traces.push(allocator.history()?);
        }
        Ok(snapshot)
    }

    fn record_history(
        &self,
        enabled: bool,
        recorder: Option<ContextRecorder>,
        max_entries: usize,
        when: RecordContext,
    ) -> ForgeResult<()> {
        for allocator in self.allocators()? {
            allocator.record_history(enabled, recorder.clone(), max_entries, when)?;
        }
        Ok(())
    }

    fn attach_out_of_memory_observer(&self, observer: OutOfMemoryObserver) -> ForgeResult<()> {
        self.oom_observers.write()?.push(observer);
        Ok(())
    }
}
