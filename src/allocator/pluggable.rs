//! Allocator backed by caller-supplied callbacks
//!
//! The callbacks only move memory. Every live pointer is recorded in a
//! side-table so statistics, snapshots, history and stream recording behave
//! as they do for the caching allocator. Each allocation counts as its own
//! segment. Callbacks are never invoked with the side-table lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::allocator::backend::{check_memory_fraction, NpuAllocator, OutOfMemoryObserver};
use crate::allocator::block::BlockPool;
use crate::allocator::config::DEFAULT_TRACE_MAX_ENTRIES;
use crate::allocator::snapshot::{BlockInfo, BlockState, SegmentInfo, SnapshotInfo};
use crate::allocator::stats::DeviceStats;
use crate::allocator::trace::{AllocationHistory, ContextRecorder, RecordContext, TraceAction, TraceEntry};
use crate::backend::acl_backend::{DeviceIndex, DevicePtr, NativeStream};
use crate::error::{ForgeResult, NpuForgeError, OomReport};
use crate::precondition_error;
use crate::stream::{NpuStream, StreamPool};

/// `(size, device, stream) -> ptr`; a null pointer means out of memory.
pub type AllocFn = Arc<dyn Fn(usize, DeviceIndex, NativeStream) -> DevicePtr + Send + Sync>;
/// `(ptr, size, device, stream)`
pub type FreeFn = Arc<dyn Fn(DevicePtr, usize, DeviceIndex, NativeStream) + Send + Sync>;
pub type InitFn = Arc<dyn Fn(DeviceIndex) + Send + Sync>;
pub type ResetFn = Arc<dyn Fn() + Send + Sync>;
pub type MemoryFractionFn = Arc<dyn Fn(f64, DeviceIndex) + Send + Sync>;
pub type BaseAllocFn = Arc<dyn Fn(DevicePtr) -> (DevicePtr, usize) + Send + Sync>;
pub type StreamFn = Arc<dyn Fn(DevicePtr, NativeStream) + Send + Sync>;

#[derive(Debug, Clone)]
struct AllocationMetadata {
    size: usize,
    device: DeviceIndex,
    stream: NpuStream,
    recorded_streams: Vec<NpuStream>,
}

#[derive(Debug, Default)]
struct PluggableState {
    metadata: HashMap<DevicePtr, AllocationMetadata>,
    stats: Vec<DeviceStats>,
    history: Vec<AllocationHistory>,
}

impl PluggableState {
    fn device(&mut self, device: DeviceIndex) -> ForgeResult<(&mut DeviceStats, &mut AllocationHistory)> {
        let count = self.stats.len();
        let index = usize::try_from(device).ok().filter(|i| *i < count).ok_or(
            NpuForgeError::InvalidDevice {
                index: device,
                count: count as DeviceIndex,
            },
        )?;
        Ok((&mut self.stats[index], &mut self.history[index]))
    }
}

pub struct PluggableAllocator {
    streams: Arc<StreamPool>,
    alloc_fn: AllocFn,
    free_fn: FreeFn,
    init_fn: Option<InitFn>,
    reset_fn: Option<ResetFn>,
    memory_fraction_fn: Option<MemoryFractionFn>,
    base_alloc_fn: Option<BaseAllocFn>,
    record_stream_fn: Option<StreamFn>,
    erase_stream_fn: Option<StreamFn>,
    initialized: AtomicBool,
    state: Mutex<PluggableState>,
    oom_observers: RwLock<Vec<OutOfMemoryObserver>>,
}

impl std::fmt::Debug for PluggableAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluggableAllocator")
            .field("initialized", &self.initialized())
            .field("has_init_fn", &self.init_fn.is_some())
            .field("has_reset_fn", &self.reset_fn.is_some())
            .field("has_base_alloc_fn", &self.base_alloc_fn.is_some())
            .finish()
    }
}

impl PluggableAllocator {
    pub fn new(streams: Arc<StreamPool>, alloc_fn: AllocFn, free_fn: FreeFn) -> Self {
        PluggableAllocator {
            streams,
            alloc_fn,
            free_fn,
            init_fn: None,
            reset_fn: None,
            memory_fraction_fn: None,
            base_alloc_fn: None,
            record_stream_fn: None,
            erase_stream_fn: None,
            initialized: AtomicBool::new(false),
            state: Mutex::new(PluggableState::default()),
            oom_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_init_fn(mut self, f: InitFn) -> Self {
        self.init_fn = Some(f);
        self
    }

    pub fn with_reset_fn(mut self, f: ResetFn) -> Self {
        self.reset_fn = Some(f);
        self
    }

    pub fn with_memory_fraction_fn(mut self, f: MemoryFractionFn) -> Self {
        self.memory_fraction_fn = Some(f);
        self
    }

    pub fn with_base_alloc_fn(mut self, f: BaseAllocFn) -> Self {
        self.base_alloc_fn = Some(f);
        self
    }

    pub fn with_record_stream_fn(mut self, f: StreamFn) -> Self {
        self.record_stream_fn = Some(f);
        self
    }

    pub fn with_erase_stream_fn(mut self, f: StreamFn) -> Self {
        self.erase_stream_fn = Some(f);
        self
    }

    fn lock(&self) -> ForgeResult<MutexGuard<'_, PluggableState>> {
        Ok(self.state.lock()?)
    }

    fn metadata(&self, ptr: DevicePtr) -> ForgeResult<AllocationMetadata> {
        self.lock()?.metadata.get(&ptr).cloned().ok_or_else(|| {
            NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
        })
    }

    /// Streams recorded for the live allocation `ptr`.
    pub fn recorded_streams(&self, ptr: DevicePtr) -> ForgeResult<Vec<NpuStream>> {
        Ok(self.metadata(ptr)?.recorded_streams)
    }

    pub fn live_allocations(&self) -> ForgeResult<usize> {
        Ok(self.lock()?.metadata.len())
    }

    fn out_of_memory(&self, size: usize, stream: &NpuStream) -> ForgeResult<NpuForgeError> {
        let device = stream.device_index();
        let free = self
            .streams
            .registry()
            .mem_get_info(device)
            .map(|info| info.free)
            .unwrap_or(0);
        let report = {
            let mut state = self.lock()?;
            let (stats, history) = state.device(device)?;
            stats.num_ooms += 1;
            history.record(TraceEntry {
                action: TraceAction::Oom,
                device,
                addr: free,
                size,
                stream: stream.id(),
                context: None,
            });
            OomReport {
                device,
                requested: size,
                allocated: stats.allocated_bytes.all.current.max(0) as usize,
                reserved: stats.reserved_bytes.all.current.max(0) as usize,
                free,
                allowed: None,
            }
        };
        let observers = self.oom_observers.read()?.clone();
        for observer in observers {
            observer(report.device, report.requested, report.allocated, report.free);
        }
        tracing::warn!("{}", report);
        Ok(NpuForgeError::OutOfMemory(Box::new(report)))
    }
}

impl NpuAllocator for PluggableAllocator {
    fn name(&self) -> &'static str {
        "pluggable"
    }

    fn init(&self, device_count: DeviceIndex) -> ForgeResult<()> {
        if let Some(init_fn) = &self.init_fn {
            init_fn(device_count);
        }
        {
            let mut state = self.lock()?;
            let count = device_count.max(0) as usize;
            if state.stats.len() < count {
                state.stats.resize_with(count, DeviceStats::default);
                state
                    .history
                    .resize_with(count, || AllocationHistory::new(DEFAULT_TRACE_MAX_ENTRIES));
            }
        }
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("Pluggable allocator initialized for {} devices", device_count);
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn raw_alloc(&self, size: usize) -> ForgeResult<DevicePtr> {
        let stream = self.streams.current_stream(None)?;
        self.raw_alloc_with_stream(size, &stream)
    }

    fn raw_alloc_with_stream(&self, size: usize, stream: &NpuStream) -> ForgeResult<DevicePtr> {
        if !self.initialized() {
            return Err(precondition_error!("pluggable allocator used before init"));
        }
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        let device = stream.device_index();
        // Reject before the callback runs; a pointer it returns could not be recorded.
        self.lock()?.device(device)?;
        let ptr = (self.alloc_fn)(size, device, stream.native());
        if ptr.is_null() {
            return Err(self.out_of_memory(size, stream)?);
        }

        let mut state = self.lock()?;
        let pool = BlockPool::for_size(size);
        let (stats, history) = state.device(device)?;
        for array in [
            &mut stats.allocation,
            &mut stats.segment,
            &mut stats.active,
        ] {
            array.update(pool, 1);
        }
        for array in [
            &mut stats.allocated_bytes,
            &mut stats.reserved_bytes,
            &mut stats.active_bytes,
            &mut stats.requested_bytes,
        ] {
            array.update(pool, size as i64);
        }
        let context = history.capture(RecordContext::Alloc);
        history.record(TraceEntry {
            action: TraceAction::Alloc,
            device,
            addr: ptr.0,
            size,
            stream: stream.id(),
            context,
        });
        state.metadata.insert(
            ptr,
            AllocationMetadata {
                size,
                device,
                stream: stream.clone(),
                recorded_streams: Vec::new(),
            },
        );
        Ok(ptr)
    }

    fn raw_delete(&self, ptr: DevicePtr) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let meta = {
            let mut state = self.lock()?;
            let meta = state.metadata.remove(&ptr).ok_or_else(|| {
                NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
            })?;
            let pool = BlockPool::for_size(meta.size);
            let (stats, history) = state.device(meta.device)?;
            for array in [
                &mut stats.allocation,
                &mut stats.segment,
                &mut stats.active,
            ] {
                array.update(pool, -1);
            }
            for array in [
                &mut stats.allocated_bytes,
                &mut stats.reserved_bytes,
                &mut stats.active_bytes,
                &mut stats.requested_bytes,
            ] {
                array.update(pool, -(meta.size as i64));
            }
            let context = history.capture(RecordContext::All);
            history.record(TraceEntry {
                action: TraceAction::FreeCompleted,
                device: meta.device,
                addr: ptr.0,
                size: meta.size,
                stream: meta.stream.id(),
                context,
            });
            meta
        };
        (self.free_fn)(ptr, meta.size, meta.device, meta.stream.native());
        Ok(())
    }

    fn empty_cache(&self) -> ForgeResult<()> {
        if let Some(reset_fn) = &self.reset_fn {
            reset_fn();
        }
        Ok(())
    }

    fn empty_device_cache(&self, _device: DeviceIndex) -> ForgeResult<()> {
        self.empty_cache()
    }

    fn set_memory_fraction(&self, fraction: f64, device: DeviceIndex) -> ForgeResult<()> {
        check_memory_fraction(fraction)?;
        match &self.memory_fraction_fn {
            Some(f) => {
                f(fraction, device);
                Ok(())
            }
            None => Err(NpuForgeError::Unsupported(
                "pluggable allocator has no memory fraction callback".to_string(),
            )),
        }
    }

    fn cache_info(&self, _device: DeviceIndex) -> ForgeResult<(usize, usize)> {
        Err(NpuForgeError::Unsupported(
            "pluggable allocator does not cache memory".to_string(),
        ))
    }

    fn get_base_allocation(&self, ptr: DevicePtr) -> ForgeResult<(DevicePtr, usize)> {
        let Some(base_alloc_fn) = &self.base_alloc_fn else {
            return Err(NpuForgeError::Unsupported(
                "pluggable allocator has no base allocation callback".to_string(),
            ));
        };
        self.metadata(ptr)?;
        Ok(base_alloc_fn(ptr))
    }

    fn record_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        {
            let mut state = self.lock()?;
            let meta = state.metadata.get_mut(&ptr).ok_or_else(|| {
                NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
            })?;
            if meta.stream != *stream && !meta.recorded_streams.contains(stream) {
                meta.recorded_streams.push(stream.clone());
            }
        }
        if let Some(f) = &self.record_stream_fn {
            f(ptr, stream.native());
        }
        Ok(())
    }

    fn erase_stream(&self, ptr: DevicePtr, stream: &NpuStream) -> ForgeResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        {
            let mut state = self.lock()?;
            let meta = state.metadata.get_mut(&ptr).ok_or_else(|| {
                NpuForgeError::InvalidArgument(format!("{} was not allocated by this allocator", ptr))
            })?;
            meta.recorded_streams.retain(|s| s != stream);
        }
        if let Some(f) = &self.erase_stream_fn {
            f(ptr, stream.native());
        }
        Ok(())
    }

    fn device_stats(&self, device: DeviceIndex) -> ForgeResult<DeviceStats> {
        let mut state = self.lock()?;
        Ok(state.device(device)?.0.clone())
    }

    fn reset_accumulated_stats(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.lock()?.device(device)?.0.reset_accumulated();
        Ok(())
    }

    fn reset_peak_stats(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.lock()?.device(device)?.0.reset_peak();
        Ok(())
    }

    fn snapshot(&self) -> ForgeResult<SnapshotInfo> {
        let state = self.lock()?;
        let mut segments: Vec<SegmentInfo> = state
            .metadata
            .iter()
            .map(|(ptr, meta)| SegmentInfo {
                device: meta.device,
                address: ptr.0,
                total_size: meta.size,
                allocated_size: meta.size,
                active_size: meta.size,
                requested_size: meta.size,
                stream: meta.stream.id(),
                segment_type: BlockPool::for_size(meta.size),
                is_expandable: false,
                blocks: vec![BlockInfo {
                    address: ptr.0,
                    size: meta.size,
                    requested_size: meta.size,
                    state: BlockState::ActiveAllocated,
                    context: None,
                }],
            })
            .collect();
        segments.sort_by_key(|s| (s.device, s.address));
        Ok(SnapshotInfo {
            segments,
            device_traces: state.history.iter().map(AllocationHistory::entries).collect(),
        })
    }

    fn record_history(
        &self,
        enabled: bool,
        recorder: Option<ContextRecorder>,
        max_entries: usize,
        when: RecordContext,
    ) -> ForgeResult<()> {
        for history in self.lock()?.history.iter_mut() {
            history.configure(enabled, recorder.clone(), max_entries, when);
        }
        Ok(())
    }

    fn attach_out_of_memory_observer(&self, observer: OutOfMemoryObserver) -> ForgeResult<()> {
        self.oom_observers.write()?.push(observer);
        Ok(())
    }
}
