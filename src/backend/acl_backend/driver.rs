//! Native driver boundary
//!
//! [`DeviceDriver`] is the only place where native runtime calls happen. The
//! registry, stream pool, allocator and adapter all talk to the device through
//! an `Arc<dyn DeviceDriver>`, which lets the same code run on the real ACL
//! runtime or on the in-process simulator.

use std::ffi::c_void;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::error::AclResult;

/// Device ordinal as understood by the native runtime.
pub type DeviceIndex = i32;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(*mut c_void);

        // SAFETY: native handles are opaque tokens owned by the runtime; the
        // runtime serializes access to the objects behind them.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub const fn null() -> Self {
                $name(std::ptr::null_mut())
            }

            pub fn from_raw(raw: *mut c_void) -> Self {
                $name(raw)
            }

            /// Build a handle from a bare address (simulated handles, stream ids).
            pub fn from_addr(addr: usize) -> Self {
                $name(addr as *mut c_void)
            }

            pub fn as_ptr(&self) -> *mut c_void {
                self.0
            }

            pub fn addr(&self) -> usize {
                self.0 as usize
            }

            pub fn is_null(&self) -> bool {
                self.0.is_null()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.addr())
            }
        }
    };
}

native_handle!(
    /// Opaque `aclrtContext`.
    NativeContext
);
native_handle!(
    /// Opaque `aclrtStream`.
    NativeStream
);
native_handle!(
    /// Opaque `aclrtEvent`.
    NativeEvent
);

/// Device memory address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    pub const fn null() -> Self {
        DevicePtr(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn offset(&self, bytes: usize) -> Self {
        DevicePtr(self.0 + bytes)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Priority class requested when creating a native stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamPriority {
    Default,
    Low,
    High,
}

/// Native event creation flags (subset of `aclrtCreateEventWithFlag`).
pub const EVENT_FLAG_SYNC: u32 = 0x1;
pub const EVENT_FLAG_TIME_LINE: u32 = 0x8;

/// Completion state of a recorded event or a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStatus {
    Complete,
    NotReady,
}

impl WorkStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, WorkStatus::Complete)
    }
}

/// Free and total device memory in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub free: usize,
    pub total: usize,
}

/// Static device description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceProperties {
    pub name: String,
    pub total_memory: usize,
}

/// Native runtime operations used by the rest of the crate.
///
/// Calls that act on "the current device" use the calling thread's device,
/// exactly like the vendor runtime.
pub trait DeviceDriver: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    fn device_count(&self) -> AclResult<u32>;
    fn get_device(&self) -> AclResult<DeviceIndex>;
    fn set_device(&self, device: DeviceIndex) -> AclResult<()>;
    fn reset_device(&self, device: DeviceIndex) -> AclResult<()>;
    fn current_context(&self) -> AclResult<NativeContext>;
    fn synchronize_device(&self) -> AclResult<()>;
    fn mem_get_info(&self) -> AclResult<MemInfo>;
    fn device_properties(&self, device: DeviceIndex) -> AclResult<DeviceProperties>;

    fn malloc(&self, size: usize) -> AclResult<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> AclResult<()>;

    fn create_stream(&self, priority: StreamPriority) -> AclResult<NativeStream>;
    fn destroy_stream(&self, stream: NativeStream) -> AclResult<()>;
    fn query_stream(&self, stream: NativeStream) -> AclResult<WorkStatus>;
    /// `None` waits forever.
    fn synchronize_stream(&self, stream: NativeStream, timeout: Option<Duration>) -> AclResult<()>;
    fn stream_wait_event(&self, stream: NativeStream, event: NativeEvent) -> AclResult<()>;

    fn create_event(&self, flags: u32) -> AclResult<NativeEvent>;
    fn destroy_event(&self, event: NativeEvent) -> AclResult<()>;
    fn record_event(&self, event: NativeEvent, stream: NativeStream) -> AclResult<()>;
    fn query_event(&self, event: NativeEvent) -> AclResult<WorkStatus>;
    fn synchronize_event(&self, event: NativeEvent) -> AclResult<()>;
}
