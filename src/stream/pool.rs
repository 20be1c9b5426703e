//! Per-device stream pools and the per-thread current stream
//!
//! Each device gets one default stream and two groups of
//! [`STREAMS_PER_POOL`] pool streams (low and high priority), all created
//! together the first time anything asks for a stream on that device. After
//! creation the tables are read without locking; handing out a pool stream
//! only bumps an atomic round-robin counter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::backend::acl_backend::{check_warn, DeviceIndex, NativeStream, StreamPriority};
use crate::device::{DeviceGuard, DeviceRegistry, DeviceType};
use crate::error::{ForgeResult, NpuForgeError};
use crate::precondition_error;
use crate::stream::npu_stream::{NpuStream, StreamClass, StreamData3, StreamId, StreamKind};

/// Streams per priority group and device.
pub const STREAMS_PER_POOL: usize = 32;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Current stream id of this thread, keyed by (pool, device).
    static CURRENT_STREAMS: RefCell<HashMap<(usize, DeviceIndex), StreamId>> =
        RefCell::new(HashMap::new());
}

struct DeviceStreams {
    default_stream: NativeStream,
    low: Vec<NativeStream>,
    high: Vec<NativeStream>,
    low_counter: AtomicU32,
    high_counter: AtomicU32,
    destroyed: AtomicBool,
}

impl DeviceStreams {
    fn group(&self, class: StreamClass) -> &[NativeStream] {
        match class {
            StreamClass::Low => &self.low,
            StreamClass::High => &self.high,
        }
    }

    fn next_index(&self, class: StreamClass) -> usize {
        let counter = match class {
            StreamClass::Low => &self.low_counter,
            StreamClass::High => &self.high_counter,
        };
        counter.fetch_add(1, Ordering::Relaxed) as usize % STREAMS_PER_POOL
    }

    fn all(&self) -> impl Iterator<Item = NativeStream> + '_ {
        std::iter::once(self.default_stream)
            .chain(self.low.iter().copied())
            .chain(self.high.iter().copied())
    }
}

/// Stream pools for every device of one registry.
pub struct StreamPool {
    id: usize,
    registry: Arc<DeviceRegistry>,
    devices: OnceCell<Vec<OnceCell<DeviceStreams>>>,
}

impl std::fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let initialized = self
            .devices
            .get()
            .map(|cells| cells.iter().filter(|c| c.get().is_some()).count())
            .unwrap_or(0);
        f.debug_struct("StreamPool")
            .field("id", &self.id)
            .field("initialized_devices", &initialized)
            .finish()
    }
}

impl StreamPool {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        StreamPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            registry,
            devices: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn resolve_device(&self, device: Option<DeviceIndex>) -> ForgeResult<DeviceIndex> {
        match device {
            Some(device) => {
                self.registry.check_device(device)?;
                Ok(device)
            }
            None => self.registry.current_device(),
        }
    }

    fn device_streams(&self, device: DeviceIndex) -> ForgeResult<&DeviceStreams> {
        let cells = self.devices.get_or_init(|| {
            (0..self.registry.device_count())
                .map(|_| OnceCell::new())
                .collect()
        });
        let cell = cells
            .get(device as usize)
            .ok_or(NpuForgeError::InvalidDevice {
                index: device,
                count: cells.len() as DeviceIndex,
            })?;
        let streams = cell.get_or_try_init(|| self.create_device_streams(device))?;
        if streams.destroyed.load(Ordering::Acquire) {
            return Err(precondition_error!(
                "streams of device {} have been destroyed",
                device
            ));
        }
        Ok(streams)
    }

    fn create_device_streams(&self, device: DeviceIndex) -> ForgeResult<DeviceStreams> {
        tracing::debug!("Creating stream pools for device {}", device);
        let _guard = DeviceGuard::new(&self.registry, device)?;
        let driver = self.registry.driver();

        let mut created: Vec<NativeStream> = Vec::with_capacity(1 + 2 * STREAMS_PER_POOL);
        let mut create = |priority: StreamPriority| -> ForgeResult<NativeStream> {
            let stream = driver.create_stream(priority)?;
            created.push(stream);
            Ok(stream)
        };

        let result = (|| -> ForgeResult<DeviceStreams> {
            let default_stream = create(StreamPriority::Default)?;
            let low = (0..STREAMS_PER_POOL)
                .map(|_| create(StreamPriority::Low))
                .collect::<ForgeResult<Vec<_>>>()?;
            let high = (0..STREAMS_PER_POOL)
                .map(|_| create(StreamPriority::High))
                .collect::<ForgeResult<Vec<_>>>()?;
            Ok(DeviceStreams {
                default_stream,
                low,
                high,
                low_counter: AtomicU32::new(0),
                high_counter: AtomicU32::new(0),
                destroyed: AtomicBool::new(false),
            })
        })();

        if result.is_err() {
            for stream in created {
                check_warn(driver.destroy_stream(stream), "destroying partially created stream");
            }
        }
        result
    }

    fn make_stream(&self, id: StreamId, device: DeviceIndex, native: NativeStream) -> NpuStream {
        NpuStream::new(id, device, native, self.registry.clone())
    }

    /// Next stream of the requested priority group, round robin.
    pub fn stream_from_pool(
        &self,
        high_priority: bool,
        device: Option<DeviceIndex>,
    ) -> ForgeResult<NpuStream> {
        let class = if high_priority {
            StreamClass::High
        } else {
            StreamClass::Low
        };
        let device = self.resolve_device(device)?;
        let streams = self.device_streams(device)?;
        let index = streams.next_index(class);
        let native = streams.group(class)[index];
        Ok(self.make_stream(StreamKind::pool_id(class, index), device, native))
    }

    /// Priority-number variant: `0` is the default class, negative values
    /// select the high-priority group.
    pub fn stream_from_pool_with_priority(
        &self,
        priority: i32,
        device: Option<DeviceIndex>,
    ) -> ForgeResult<NpuStream> {
        self.stream_from_pool(priority < 0, device)
    }

    pub fn default_stream(&self, device: Option<DeviceIndex>) -> ForgeResult<NpuStream> {
        let device = self.resolve_device(device)?;
        let streams = self.device_streams(device)?;
        Ok(self.make_stream(0, device, streams.default_stream))
    }

    /// Wrap a stream created outside the pool. No bookkeeping is kept.
    pub fn stream_from_external(
        &self,
        native: NativeStream,
        device: Option<DeviceIndex>,
    ) -> ForgeResult<NpuStream> {
        if native.is_null() || native.addr() & 1 == 1 {
            return Err(NpuForgeError::InvalidArgument(format!(
                "external stream handle {:?} must be non-null and aligned",
                native
            )));
        }
        let device = self.resolve_device(device)?;
        Ok(self.make_stream(native.addr() as StreamId, device, native))
    }

    /// Current stream of the calling thread on `device` (default if unset).
    pub fn current_stream(&self, device: Option<DeviceIndex>) -> ForgeResult<NpuStream> {
        let device = self.resolve_device(device)?;
        let id = CURRENT_STREAMS.with(|map| map.borrow().get(&(self.id, device)).copied());
        match id {
            Some(id) => self.stream_from_id(id, device),
            None => self.default_stream(Some(device)),
        }
    }

    /// Make `stream` current on its device for the calling thread.
    ///
    /// Does not change the active device.
    pub fn set_current_stream(&self, stream: &NpuStream) {
        CURRENT_STREAMS.with(|map| {
            map.borrow_mut()
                .insert((self.id, stream.device_index()), stream.id())
        });
    }

    /// Rebuild a stream from its three-integer encoding.
    pub fn unpack3(&self, data: StreamData3) -> ForgeResult<NpuStream> {
        if DeviceType::from_tag(data.device_type) != Some(DeviceType::Npu) {
            return Err(NpuForgeError::InvalidArgument(format!(
                "stream data has device type {}, expected NPU",
                data.device_type
            )));
        }
        self.registry.check_device(data.device_index)?;
        self.stream_from_id(data.stream_id, data.device_index)
    }

    fn stream_from_id(&self, id: StreamId, device: DeviceIndex) -> ForgeResult<NpuStream> {
        let kind = StreamKind::from_id(id).ok_or_else(|| {
            NpuForgeError::InvalidArgument(format!("{} is not a valid stream id", id))
        })?;
        match kind {
            StreamKind::Default => self.default_stream(Some(device)),
            StreamKind::Pool { class, index } => {
                let streams = self.device_streams(device)?;
                let native = *streams.group(class).get(index).ok_or_else(|| {
                    NpuForgeError::InvalidArgument(format!(
                        "stream id {} refers to pool index {} (pool size {})",
                        id, index, STREAMS_PER_POOL
                    ))
                })?;
                Ok(self.make_stream(id, device, native))
            }
            StreamKind::External => Ok(self.make_stream(
                id,
                device,
                NativeStream::from_addr(id as usize),
            )),
        }
    }

    /// Destroy every native stream this pool created.
    ///
    /// Idempotent; devices whose pools were never created are skipped and
    /// destruction failures are logged. Later stream requests for a torn down
    /// device fail.
    pub fn destroy_all_streams(&self) {
        let Some(cells) = self.devices.get() else {
            return;
        };
        for (device, cell) in cells.iter().enumerate() {
            let Some(streams) = cell.get() else {
                continue;
            };
            if streams.destroyed.swap(true, Ordering::AcqRel) {
                continue;
            }
            let device = device as DeviceIndex;
            let _guard = match DeviceGuard::new(&self.registry, device) {
                Ok(guard) => Some(guard),
                Err(err) => {
                    tracing::warn!("Could not activate device {} for stream teardown: {}", device, err);
                    None
                }
            };
            for native in streams.all() {
                check_warn(
                    self.registry.driver().destroy_stream(native),
                    "destroying pool stream",
                );
            }
            tracing::debug!("Destroyed stream pools of device {}", device);
        }
    }
}
