//! ACL runtime FFI bindings
//!
//! Bound against `libascendcl`. Only the subset used by [`super::AclDriver`]
//! is declared. The dead_code allowance covers the status constants that are
//! only compared against inside unsafe call sites.

use std::ffi::{c_char, c_void};

pub type AclrtContext = *mut c_void;
pub type AclrtStream = *mut c_void;
pub type AclrtEvent = *mut c_void;

#[allow(dead_code)]
pub const ACL_MEM_MALLOC_HUGE_FIRST: u32 = 0;
#[allow(dead_code)]
pub const ACL_HBM_MEM: u32 = 1;

#[allow(dead_code)]
pub const ACL_STREAM_FAST_LAUNCH: u32 = 0x1;
#[allow(dead_code)]
pub const ACL_STREAM_FAST_SYNC: u32 = 0x2;

#[allow(dead_code)]
pub const ACL_STREAM_STATUS_COMPLETE: u32 = 0;
#[allow(dead_code)]
pub const ACL_STREAM_STATUS_NOT_READY: u32 = 1;

#[allow(dead_code)]
pub const ACL_EVENT_RECORDED_STATUS_NOT_READY: u32 = 0;
#[allow(dead_code)]
pub const ACL_EVENT_RECORDED_STATUS_COMPLETE: u32 = 1;

#[link(name = "ascendcl")]
#[allow(dead_code)]
extern "C" {
    pub fn aclInit(config_path: *const c_char) -> i32;
    pub fn aclGetRecentErrMsg() -> *const c_char;
    pub fn aclrtGetSocName() -> *const c_char;

    pub fn aclrtGetDeviceCount(count: *mut u32) -> i32;
    pub fn aclrtSetDevice(device_id: i32) -> i32;
    pub fn aclrtGetDevice(device_id: *mut i32) -> i32;
    pub fn aclrtResetDevice(device_id: i32) -> i32;
    pub fn aclrtGetCurrentContext(context: *mut AclrtContext) -> i32;
    pub fn aclrtSynchronizeDevice() -> i32;
    pub fn aclrtGetMemInfo(attr: u32, free: *mut usize, total: *mut usize) -> i32;

    pub fn aclrtMalloc(dev_ptr: *mut *mut c_void, size: usize, policy: u32) -> i32;
    pub fn aclrtFree(dev_ptr: *mut c_void) -> i32;

    pub fn aclrtCreateStreamWithConfig(stream: *mut AclrtStream, priority: u32, flag: u32) -> i32;
    pub fn aclrtDestroyStream(stream: AclrtStream) -> i32;
    pub fn aclrtStreamQuery(stream: AclrtStream, status: *mut u32) -> i32;
    pub fn aclrtSynchronizeStreamWithTimeout(stream: AclrtStream, timeout: i32) -> i32;
    pub fn aclrtStreamWaitEvent(stream: AclrtStream, event: AclrtEvent) -> i32;

    pub fn aclrtCreateEventWithFlag(event: *mut AclrtEvent, flag: u32) -> i32;
    pub fn aclrtDestroyEvent(event: AclrtEvent) -> i32;
    pub fn aclrtRecordEvent(event: AclrtEvent, stream: AclrtStream) -> i32;
    pub fn aclrtQueryEventStatus(event: AclrtEvent, status: *mut u32) -> i32;
    pub fn aclrtSynchronizeEvent(event: AclrtEvent) -> i32;
}
