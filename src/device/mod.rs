//! Device context registry and scoped device switching

mod guard;
mod registry;
mod types;

pub use guard::DeviceGuard;
pub use registry::{DeviceRegistry, SyncDebugMode};
pub use types::{Device, DeviceType};
