//! ACL runtime boundary
//!
//! Native status codes, handle types and the [`DeviceDriver`] trait. The FFI
//! driver is only compiled with the `acl` feature.

#[cfg(feature = "acl")]
mod acl_driver;
pub mod driver;
pub mod error;
#[cfg(feature = "acl")]
mod ffi;

#[cfg(feature = "acl")]
pub use acl_driver::AclDriver;
pub use driver::{
    DeviceDriver, DeviceIndex, DeviceProperties, DevicePtr, MemInfo, NativeContext, NativeEvent,
    NativeStream, StreamPriority, WorkStatus, EVENT_FLAG_SYNC, EVENT_FLAG_TIME_LINE,
};
pub use error::{check, check_warn, AclError, AclResult};
