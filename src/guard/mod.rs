//! Capability adapter for host frameworks

pub mod event;
pub mod npu_guard;

pub use event::NpuEvent;
pub use npu_guard::{DeviceGuardImpl, NpuGuardImpl};
