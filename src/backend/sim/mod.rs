//! In-process simulated NPU
//!
//! `SimDriver` implements [`DeviceDriver`] with host-side bookkeeping only. It
//! keeps the parts of the native runtime's behaviour the rest of the crate
//! depends on:
//!
//! - the current device is per thread, and "no context yet" is reported with
//!   the same code the real runtime uses
//! - device memory has a fixed capacity and allocations fail with the native
//!   out-of-memory code once it is exhausted
//! - streams count submitted and completed work; events capture the amount of
//!   work submitted when they were recorded and complete once the stream has
//!   caught up
//!
//! Work is only "executed" when a test calls [`SimDriver::complete_work`] or
//! when something synchronizes, so stream-ordering scenarios are deterministic.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::acl_backend::error::{
    ACL_ERROR_RT_CONTEXT_NULL, ACL_ERROR_RT_INVALID_DEVICEID, ACL_ERROR_RT_MEMORY_ALLOCATION,
    ACL_ERROR_RT_PARAM_INVALID,
};
use crate::backend::acl_backend::{
    AclError, AclResult, DeviceDriver, DeviceIndex, DeviceProperties, DevicePtr, MemInfo,
    NativeContext, NativeEvent, NativeStream, StreamPriority, WorkStatus,
};

/// Address space stride between simulated devices.
const DEVICE_ADDRESS_STRIDE: usize = 1 << 40;
/// Allocation granularity of simulated device memory.
const SIM_ALIGNMENT: usize = 512;
/// First value handed out for stream/event/context handles.
const FIRST_HANDLE: usize = 0x1000;
const HANDLE_STRIDE: usize = 0x100;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current device of this thread, per simulated driver instance.
    static CURRENT_DEVICE: RefCell<HashMap<u64, DeviceIndex>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct SimDevice {
    context: Option<NativeContext>,
    used: usize,
    next_offset: usize,
    live: HashMap<usize, usize>,
    malloc_calls: usize,
    free_calls: usize,
    reset_calls: usize,
    synchronize_calls: usize,
    fail_next_reset: Option<i32>,
}

#[derive(Debug)]
struct SimStream {
    device: DeviceIndex,
    priority: StreamPriority,
    submitted: u64,
    completed: u64,
}

#[derive(Debug)]
struct SimEvent {
    stream: Option<NativeStream>,
    target: u64,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimDevice>,
    streams: HashMap<NativeStream, SimStream>,
    events: HashMap<NativeEvent, SimEvent>,
    next_handle: usize,
    malloc_failures: usize,
    record_event_failures: usize,
    streams_created: usize,
    streams_destroyed: usize,
    events_created: usize,
    events_destroyed: usize,
}

impl SimState {
    fn next_handle(&mut self) -> usize {
        let handle = self.next_handle;
        self.next_handle += HANDLE_STRIDE;
        handle
    }

    fn device_mut(&mut self, device: DeviceIndex, api: &'static str) -> AclResult<&mut SimDevice> {
        let count = self.devices.len();
        usize::try_from(device)
            .ok()
            .and_then(|index| self.devices.get_mut(index))
            .ok_or_else(|| {
                AclError::runtime(
                    api,
                    ACL_ERROR_RT_INVALID_DEVICEID,
                    format!("device {} out of range (0..{})", device, count),
                )
            })
    }

    fn stream_mut(&mut self, stream: NativeStream, api: &'static str) -> AclResult<&mut SimStream> {
        self.streams.get_mut(&stream).ok_or_else(|| {
            AclError::runtime(api, ACL_ERROR_RT_PARAM_INVALID, format!("unknown stream {:?}", stream))
        })
    }
}

/// Simulated NPU driver.
#[derive(Debug)]
pub struct SimDriver {
    id: u64,
    memory_per_device: usize,
    state: Mutex<SimState>,
}

impl SimDriver {
    /// Create a driver exposing `device_count` devices of `memory_per_device` bytes each.
    pub fn new(device_count: usize, memory_per_device: usize) -> Self {
        let devices = (0..device_count).map(|_| SimDevice::default()).collect();
        SimDriver {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            memory_per_device,
            state: Mutex::new(SimState {
                devices,
                next_handle: FIRST_HANDLE,
                ..SimState::default()
            }),
        }
    }

    fn current(&self, api: &'static str) -> AclResult<DeviceIndex> {
        CURRENT_DEVICE
            .with(|map| map.borrow().get(&self.id).copied())
            .ok_or_else(|| {
                AclError::runtime(api, ACL_ERROR_RT_CONTEXT_NULL, "no context on this thread")
            })
    }

    // ========== Test controls ==========

    /// Submit one unit of work to `stream`.
    pub fn launch_work(&self, stream: NativeStream) -> AclResult<()> {
        let mut state = self.state.lock()?;
        state.stream_mut(stream, "launch_work")?.submitted += 1;
        Ok(())
    }

    /// Finish everything submitted to `stream` so far.
    pub fn complete_work(&self, stream: NativeStream) -> AclResult<()> {
        let mut state = self.state.lock()?;
        let sim = state.stream_mut(stream, "complete_work")?;
        sim.completed = sim.submitted;
        Ok(())
    }

    /// Work submitted to `stream` that has not completed yet.
    pub fn pending_work(&self, stream: NativeStream) -> AclResult<u64> {
        let mut state = self.state.lock()?;
        let sim = state.stream_mut(stream, "pending_work")?;
        Ok(sim.submitted - sim.completed)
    }

    /// Make the next `count` calls to `malloc` fail with the out-of-memory code.
    pub fn inject_malloc_failures(&self, count: usize) -> AclResult<()> {
        self.state.lock()?.malloc_failures = count;
        Ok(())
    }

    /// Make the next `count` calls to `record_event` fail with an invalid-parameter code.
    pub fn inject_record_event_failures(&self, count: usize) -> AclResult<()> {
        self.state.lock()?.record_event_failures = count;
        Ok(())
    }

    /// Make the next reset of `device` fail with `code`.
    pub fn fail_next_reset(&self, device: DeviceIndex, code: i32) -> AclResult<()> {
        let mut state = self.state.lock()?;
        state.device_mut(device, "fail_next_reset")?.fail_next_reset = Some(code);
        Ok(())
    }

    pub fn malloc_calls(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "malloc_calls")?.malloc_calls)
    }

    pub fn free_calls(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "free_calls")?.free_calls)
    }

    pub fn reset_calls(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "reset_calls")?.reset_calls)
    }

    pub fn synchronize_calls(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "synchronize_calls")?.synchronize_calls)
    }

    /// Number of live native allocations on `device`.
    pub fn live_allocations(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "live_allocations")?.live.len())
    }

    /// Bytes of device memory currently handed out on `device`.
    pub fn used_memory(&self, device: DeviceIndex) -> AclResult<usize> {
        Ok(self.state.lock()?.device_mut(device, "used_memory")?.used)
    }

    pub fn context_of(&self, device: DeviceIndex) -> AclResult<Option<NativeContext>> {
        Ok(self.state.lock()?.device_mut(device, "context_of")?.context)
    }

    pub fn live_streams(&self) -> AclResult<usize> {
        Ok(self.state.lock()?.streams.len())
    }

    pub fn streams_created(&self) -> AclResult<usize> {
        Ok(self.state.lock()?.streams_created)
    }

    pub fn streams_destroyed(&self) -> AclResult<usize> {
        Ok(self.state.lock()?.streams_destroyed)
    }

    pub fn live_events(&self) -> AclResult<usize> {
        Ok(self.state.lock()?.events.len())
    }

    pub fn events_created(&self) -> AclResult<usize> {
        Ok(self.state.lock()?.events_created)
    }

    /// Device a stream was created on and its priority class.
    pub fn stream_info(&self, stream: NativeStream) -> AclResult<(DeviceIndex, StreamPriority)> {
        let mut state = self.state.lock()?;
        let sim = state.stream_mut(stream, "stream_info")?;
        Ok((sim.device, sim.priority))
    }
}

impl DeviceDriver for SimDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_count(&self) -> AclResult<u32> {
        Ok(self.state.lock()?.devices.len() as u32)
    }

    fn get_device(&self) -> AclResult<DeviceIndex> {
        self.current("aclrtGetDevice")
    }

    fn set_device(&self, device: DeviceIndex) -> AclResult<()> {
        let mut state = self.state.lock()?;
        let handle = state.next_handle();
        let sim = state.device_mut(device, "aclrtSetDevice")?;
        if sim.context.is_none() {
            sim.context = Some(NativeContext::from_addr(handle));
            tracing::trace!("SimDriver: created context {:#x} for device {}", handle, device);
        }
        CURRENT_DEVICE.with(|map| map.borrow_mut().insert(self.id, device));
        Ok(())
    }

    fn reset_device(&self, device: DeviceIndex) -> AclResult<()> {
        let mut state = self.state.lock()?;
        let sim = state.device_mut(device, "aclrtResetDevice")?;
        sim.reset_calls += 1;
        if let Some(code) = sim.fail_next_reset.take() {
            return Err(AclError::runtime(
                "aclrtResetDevice",
                code,
                format!("injected reset failure on device {}", device),
            ));
        }
        sim.context = None;
        CURRENT_DEVICE.with(|map| {
            let mut map = map.borrow_mut();
            if map.get(&self.id) == Some(&device) {
                map.remove(&self.id);
            }
        });
        Ok(())
    }

    fn current_context(&self) -> AclResult<NativeContext> {
        let device = self.current("aclrtGetCurrentContext")?;
        let mut state = self.state.lock()?;
        state
            .device_mut(device, "aclrtGetCurrentContext")?
            .context
            .ok_or_else(|| {
                AclError::runtime(
                    "aclrtGetCurrentContext",
                    ACL_ERROR_RT_CONTEXT_NULL,
                    format!("device {} has no context", device),
                )
            })
    }

    fn synchronize_device(&self) -> AclResult<()> {
        let device = self.current("aclrtSynchronizeDevice")?;
        let mut state = self.state.lock()?;
        state.device_mut(device, "aclrtSynchronizeDevice")?.synchronize_calls += 1;
        for stream in state.streams.values_mut().filter(|s| s.device == device) {
            stream.completed = stream.submitted;
        }
        Ok(())
    }

    fn mem_get_info(&self) -> AclResult<MemInfo> {
        let device = self.current("aclrtGetMemInfo")?;
        let total = self.memory_per_device;
        let mut state = self.state.lock()?;
        let sim = state.device_mut(device, "aclrtGetMemInfo")?;
        Ok(MemInfo {
            free: total.saturating_sub(sim.used),
            total,
        })
    }

    fn device_properties(&self, device: DeviceIndex) -> AclResult<DeviceProperties> {
        let mut state = self.state.lock()?;
        state.device_mut(device, "aclrtGetDeviceProperties")?;
        Ok(DeviceProperties {
            name: format!("SimNPU-{}", device),
            total_memory: self.memory_per_device,
        })
    }

    fn malloc(&self, size: usize) -> AclResult<DevicePtr> {
        let device = self.current("aclrtMalloc")?;
        let capacity = self.memory_per_device;
        let mut state = self.state.lock()?;
        let injected = state.malloc_failures > 0;
        if injected {
            state.malloc_failures -= 1;
        }
        let sim = state.device_mut(device, "aclrtMalloc")?;
        sim.malloc_calls += 1;
        if injected || size > capacity.saturating_sub(sim.used) {
            return Err(AclError::runtime(
                "aclrtMalloc",
                ACL_ERROR_RT_MEMORY_ALLOCATION,
                format!(
                    "cannot allocate {} bytes on device {} ({} of {} bytes in use)",
                    size, device, sim.used, capacity
                ),
            ));
        }
        let base = DEVICE_ADDRESS_STRIDE * (device as usize + 1);
        let addr = base + sim.next_offset;
        sim.next_offset += size.div_ceil(SIM_ALIGNMENT).max(1) * SIM_ALIGNMENT;
        sim.used += size;
        sim.live.insert(addr, size);
        Ok(DevicePtr(addr))
    }

    fn free(&self, ptr: DevicePtr) -> AclResult<()> {
        let device = self.current("aclrtFree")?;
        let mut state = self.state.lock()?;
        let sim = state.device_mut(device, "aclrtFree")?;
        let size = sim.live.remove(&ptr.0).ok_or_else(|| {
            AclError::runtime(
                "aclrtFree",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("{} is not a live allocation on device {}", ptr, device),
            )
        })?;
        sim.used -= size;
        sim.free_calls += 1;
        Ok(())
    }

    fn create_stream(&self, priority: StreamPriority) -> AclResult<NativeStream> {
        let device = self.current("aclrtCreateStreamWithConfig")?;
        let mut state = self.state.lock()?;
        state.device_mut(device, "aclrtCreateStreamWithConfig")?;
        let stream = NativeStream::from_addr(state.next_handle());
        state.streams.insert(
            stream,
            SimStream {
                device,
                priority,
                submitted: 0,
                completed: 0,
            },
        );
        state.streams_created += 1;
        Ok(stream)
    }

    fn destroy_stream(&self, stream: NativeStream) -> AclResult<()> {
        let mut state = self.state.lock()?;
        if state.streams.remove(&stream).is_none() {
            return Err(AclError::runtime(
                "aclrtDestroyStream",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("unknown stream {:?}", stream),
            ));
        }
        state.streams_destroyed += 1;
        Ok(())
    }

    fn query_stream(&self, stream: NativeStream) -> AclResult<WorkStatus> {
        let mut state = self.state.lock()?;
        let sim = state.stream_mut(stream, "aclrtStreamQuery")?;
        Ok(if sim.completed >= sim.submitted {
            WorkStatus::Complete
        } else {
            WorkStatus::NotReady
        })
    }

    fn synchronize_stream(&self, stream: NativeStream, _timeout: Option<Duration>) -> AclResult<()> {
        let mut state = self.state.lock()?;
        let sim = state.stream_mut(stream, "aclrtSynchronizeStreamWithTimeout")?;
        sim.completed = sim.submitted;
        Ok(())
    }

    fn stream_wait_event(&self, stream: NativeStream, event: NativeEvent) -> AclResult<()> {
        let mut state = self.state.lock()?;
        state.stream_mut(stream, "aclrtStreamWaitEvent")?;
        if !state.events.contains_key(&event) {
            return Err(AclError::runtime(
                "aclrtStreamWaitEvent",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("unknown event {:?}", event),
            ));
        }
        Ok(())
    }

    fn create_event(&self, _flags: u32) -> AclResult<NativeEvent> {
        let mut state = self.state.lock()?;
        let event = NativeEvent::from_addr(state.next_handle());
        state.events.insert(
            event,
            SimEvent {
                stream: None,
                target: 0,
            },
        );
        state.events_created += 1;
        Ok(event)
    }

    fn destroy_event(&self, event: NativeEvent) -> AclResult<()> {
        let mut state = self.state.lock()?;
        if state.events.remove(&event).is_none() {
            return Err(AclError::runtime(
                "aclrtDestroyEvent",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("unknown event {:?}", event),
            ));
        }
        state.events_destroyed += 1;
        Ok(())
    }

    fn record_event(&self, event: NativeEvent, stream: NativeStream) -> AclResult<()> {
        let mut state = self.state.lock()?;
        if state.record_event_failures > 0 {
            state.record_event_failures -= 1;
            return Err(AclError::runtime(
                "aclrtRecordEvent",
                ACL_ERROR_RT_PARAM_INVALID,
                "injected record failure",
            ));
        }
        let target = state.stream_mut(stream, "aclrtRecordEvent")?.submitted;
        let sim = state.events.get_mut(&event).ok_or_else(|| {
            AclError::runtime(
                "aclrtRecordEvent",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("unknown event {:?}", event),
            )
        })?;
        sim.stream = Some(stream);
        sim.target = target;
        Ok(())
    }

    fn query_event(&self, event: NativeEvent) -> AclResult<WorkStatus> {
        let state = self.state.lock()?;
        let sim = state.events.get(&event).ok_or_else(|| {
            AclError::runtime(
                "aclrtQueryEventStatus",
                ACL_ERROR_RT_PARAM_INVALID,
                format!("unknown event {:?}", event),
            )
        })?;
        let complete = match sim.stream.and_then(|s| state.streams.get(&s)) {
            Some(stream) => stream.completed >= sim.target,
            None => true,
        };
        Ok(if complete {
            WorkStatus::Complete
        } else {
            WorkStatus::NotReady
        })
    }

    fn synchronize_event(&self, event: NativeEvent) -> AclResult<()> {
        let mut state = self.state.lock()?;
        let (stream, target) = match state.events.get(&event) {
            Some(sim) => (sim.stream, sim.target),
            None => {
                return Err(AclError::runtime(
                    "aclrtSynchronizeEvent",
                    ACL_ERROR_RT_PARAM_INVALID,
                    format!("unknown event {:?}", event),
                ))
            }
        };
        if let Some(sim) = stream.and_then(|s| state.streams.get_mut(&s)) {
            sim.completed = sim.completed.max(target);
        }
        Ok(())
    }
}
