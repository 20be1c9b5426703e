//! Driver backed by the vendor ACL runtime

use std::ffi::CStr;
use std::ptr;
use std::time::Duration;

use once_cell::sync::OnceCell;

use super::driver::{
    DeviceDriver, DeviceIndex, DeviceProperties, DevicePtr, MemInfo, NativeContext, NativeEvent,
    NativeStream, StreamPriority, WorkStatus,
};
use super::error::{check, AclError, AclResult};
use super::ffi;

/// `aclInit` reports this when the process already initialized ACL.
const ACL_ERROR_REPEAT_INITIALIZE: i32 = 100002;

const STREAM_PRIORITY_HIGH: u32 = 0;
const STREAM_PRIORITY_LOW: u32 = 3;

static ACL_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Read the runtime's recent error message for the calling thread.
fn recent_error_message() -> String {
    // SAFETY: aclGetRecentErrMsg returns either null or a NUL-terminated
    // string owned by the runtime that stays valid until the next ACL call.
    unsafe {
        let msg = ffi::aclGetRecentErrMsg();
        if msg.is_null() {
            "no error message available".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn acl_check(code: i32, api: &'static str) -> AclResult<()> {
    check(code, api, recent_error_message)
}

/// Native driver that forwards every call to `libascendcl`.
#[derive(Debug)]
pub struct AclDriver {
    _private: (),
}

impl AclDriver {
    /// Initialize the ACL runtime (once per process) and return a driver.
    pub fn new() -> AclResult<Self> {
        ACL_INITIALIZED.get_or_try_init(|| {
            tracing::debug!("AclDriver::new: calling aclInit");
            let result = unsafe { ffi::aclInit(ptr::null()) };
            if result == ACL_ERROR_REPEAT_INITIALIZE {
                tracing::debug!("AclDriver::new: ACL already initialized");
                return Ok(());
            }
            acl_check(result, "aclInit")
        })?;
        Ok(AclDriver { _private: () })
    }
}

impl DeviceDriver for AclDriver {
    fn name(&self) -> &'static str {
        "acl"
    }

    fn device_count(&self) -> AclResult<u32> {
        let mut count: u32 = 0;
        acl_check(unsafe { ffi::aclrtGetDeviceCount(&mut count) }, "aclrtGetDeviceCount")?;
        Ok(count)
    }

    fn get_device(&self) -> AclResult<DeviceIndex> {
        let mut device: i32 = -1;
        acl_check(unsafe { ffi::aclrtGetDevice(&mut device) }, "aclrtGetDevice")?;
        Ok(device)
    }

    fn set_device(&self, device: DeviceIndex) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtSetDevice(device) }, "aclrtSetDevice")
    }

    fn reset_device(&self, device: DeviceIndex) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtResetDevice(device) }, "aclrtResetDevice")
    }

    fn current_context(&self) -> AclResult<NativeContext> {
        let mut context: ffi::AclrtContext = ptr::null_mut();
        acl_check(
            unsafe { ffi::aclrtGetCurrentContext(&mut context) },
            "aclrtGetCurrentContext",
        )?;
        Ok(NativeContext::from_raw(context))
    }

    fn synchronize_device(&self) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtSynchronizeDevice() }, "aclrtSynchronizeDevice")
    }

    fn mem_get_info(&self) -> AclResult<MemInfo> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        acl_check(
            unsafe { ffi::aclrtGetMemInfo(ffi::ACL_HBM_MEM, &mut free, &mut total) },
            "aclrtGetMemInfo",
        )?;
        Ok(MemInfo { free, total })
    }

    fn device_properties(&self, device: DeviceIndex) -> AclResult<DeviceProperties> {
        // SAFETY: aclrtGetSocName returns a static NUL-terminated string or null.
        let name = unsafe {
            let soc = ffi::aclrtGetSocName();
            if soc.is_null() {
                format!("Ascend NPU {}", device)
            } else {
                CStr::from_ptr(soc).to_string_lossy().into_owned()
            }
        };
        let info = self.mem_get_info()?;
        Ok(DeviceProperties {
            name,
            total_memory: info.total,
        })
    }

    fn malloc(&self, size: usize) -> AclResult<DevicePtr> {
        let mut ptr: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::aclrtMalloc(&mut ptr, size, ffi::ACL_MEM_MALLOC_HUGE_FIRST) };
        tracing::trace!("aclrtMalloc(size={}) returned result={}, ptr={:?}", size, result, ptr);
        acl_check(result, "aclrtMalloc")?;
        if ptr.is_null() {
            return Err(AclError::runtime(
                "aclrtMalloc",
                -1,
                "aclrtMalloc returned null pointer",
            ));
        }
        Ok(DevicePtr(ptr as usize))
    }

    fn free(&self, ptr: DevicePtr) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtFree(ptr.as_ptr()) }, "aclrtFree")
    }

    fn create_stream(&self, priority: StreamPriority) -> AclResult<NativeStream> {
        let native_priority = match priority {
            StreamPriority::High => STREAM_PRIORITY_HIGH,
            StreamPriority::Default | StreamPriority::Low => STREAM_PRIORITY_LOW,
        };
        let mut stream: ffi::AclrtStream = ptr::null_mut();
        acl_check(
            unsafe {
                ffi::aclrtCreateStreamWithConfig(
                    &mut stream,
                    native_priority,
                    ffi::ACL_STREAM_FAST_LAUNCH | ffi::ACL_STREAM_FAST_SYNC,
                )
            },
            "aclrtCreateStreamWithConfig",
        )?;
        if stream.is_null() {
            return Err(AclError::runtime(
                "aclrtCreateStreamWithConfig",
                -1,
                "returned null stream",
            ));
        }
        Ok(NativeStream::from_raw(stream))
    }

    fn destroy_stream(&self, stream: NativeStream) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtDestroyStream(stream.as_ptr()) }, "aclrtDestroyStream")
    }

    fn query_stream(&self, stream: NativeStream) -> AclResult<WorkStatus> {
        let mut status: u32 = ffi::ACL_STREAM_STATUS_NOT_READY;
        acl_check(
            unsafe { ffi::aclrtStreamQuery(stream.as_ptr(), &mut status) },
            "aclrtStreamQuery",
        )?;
        Ok(if status == ffi::ACL_STREAM_STATUS_COMPLETE {
            WorkStatus::Complete
        } else {
            WorkStatus::NotReady
        })
    }

    fn synchronize_stream(&self, stream: NativeStream, timeout: Option<Duration>) -> AclResult<()> {
        let timeout_ms = match timeout {
            Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        acl_check(
            unsafe { ffi::aclrtSynchronizeStreamWithTimeout(stream.as_ptr(), timeout_ms) },
            "aclrtSynchronizeStreamWithTimeout",
        )
    }

    fn stream_wait_event(&self, stream: NativeStream, event: NativeEvent) -> AclResult<()> {
        acl_check(
            unsafe { ffi::aclrtStreamWaitEvent(stream.as_ptr(), event.as_ptr()) },
            "aclrtStreamWaitEvent",
        )
    }

    fn create_event(&self, flags: u32) -> AclResult<NativeEvent> {
        let mut event: ffi::AclrtEvent = ptr::null_mut();
        acl_check(
            unsafe { ffi::aclrtCreateEventWithFlag(&mut event, flags) },
            "aclrtCreateEventWithFlag",
        )?;
        if event.is_null() {
            return Err(AclError::runtime(
                "aclrtCreateEventWithFlag",
                -1,
                "returned null event",
            ));
        }
        Ok(NativeEvent::from_raw(event))
    }

    fn destroy_event(&self, event: NativeEvent) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtDestroyEvent(event.as_ptr()) }, "aclrtDestroyEvent")
    }

    fn record_event(&self, event: NativeEvent, stream: NativeStream) -> AclResult<()> {
        acl_check(
            unsafe { ffi::aclrtRecordEvent(event.as_ptr(), stream.as_ptr()) },
            "aclrtRecordEvent",
        )
    }

    fn query_event(&self, event: NativeEvent) -> AclResult<WorkStatus> {
        let mut status: u32 = ffi::ACL_EVENT_RECORDED_STATUS_NOT_READY;
        acl_check(
            unsafe { ffi::aclrtQueryEventStatus(event.as_ptr(), &mut status) },
            "aclrtQueryEventStatus",
        )?;
        Ok(if status == ffi::ACL_EVENT_RECORDED_STATUS_COMPLETE {
            WorkStatus::Complete
        } else {
            WorkStatus::NotReady
        })
    }

    fn synchronize_event(&self, event: NativeEvent) -> AclResult<()> {
        acl_check(unsafe { ffi::aclrtSynchronizeEvent(event.as_ptr()) }, "aclrtSynchronizeEvent")
    }
}
