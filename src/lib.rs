//! NpuForge - Ascend NPU device runtime
//!
//! Device context bookkeeping, per-device stream pools and a stream-aware
//! caching allocator for Ascend NPUs, plus the capability adapter host
//! frameworks dispatch device and event operations through.
//!
//! Native calls go through a [`backend::acl_backend::DeviceDriver`]. The
//! `acl` feature links `libascendcl` and provides the real driver;
//! [`backend::sim::SimDriver`] simulates devices in-process.

#![allow(clippy::type_complexity)] // callback and observer signatures

pub mod allocator;
pub mod backend;
pub mod device;
pub mod error;
pub mod guard;
pub mod logging;
pub mod runtime;
pub mod stream;

pub use allocator::{
    free_mutex, AllocatorConfig, DataPtr, DeviceStats, NpuAllocator, NpuCachingAllocator,
    PluggableAllocator, ReleasePolicy, SnapshotInfo,
};
pub use backend::acl_backend::{AclError, DeviceDriver, DeviceIndex, DevicePtr};
pub use backend::sim::SimDriver;
pub use device::{DeviceGuard, DeviceRegistry, SyncDebugMode};
pub use error::{ErrorCategory, ForgeResult, NpuForgeError};
pub use guard::{DeviceGuardImpl, NpuEvent, NpuGuardImpl};
pub use logging::{init_logging_default, init_with_config, LoggingConfig};
pub use runtime::NpuRuntime;
pub use stream::{NpuStream, StreamGuard, StreamPool};
