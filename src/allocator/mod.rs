//! Device memory allocation
//!
//! - [`NpuCachingAllocator`]: per-device block cache with stream-aware reuse
//! - [`PluggableAllocator`]: caller-supplied allocate/free with the same
//!   introspection surface
//!
//! Both implement [`NpuAllocator`].

pub mod backend;
pub mod block;
pub mod caching;
pub mod config;
mod device_allocator;
pub mod pluggable;
pub mod snapshot;
pub mod stats;
pub mod trace;

pub use backend::{free_mutex, DataPtr, NpuAllocator, OutOfMemoryObserver};
pub use block::BlockPool;
pub use caching::NpuCachingAllocator;
pub use config::{AllocatorConfig, ReleasePolicy};
pub use pluggable::PluggableAllocator;
pub use snapshot::{BlockInfo, BlockState, SegmentInfo, SnapshotInfo};
pub use stats::{DeviceStats, Stat, StatArray, StatType};
pub use trace::{ContextRecorder, RecordContext, TraceAction, TraceEntry};
