//! Scoped device switch

use crate::backend::acl_backend::DeviceIndex;
use crate::device::DeviceRegistry;
use crate::error::ForgeResult;

/// Activates a device for the lifetime of the guard and restores the
/// previously active device on drop.
///
/// Restoring never panics; a failure is logged.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    registry: &'a DeviceRegistry,
    original: DeviceIndex,
    current: DeviceIndex,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(registry: &'a DeviceRegistry, device: DeviceIndex) -> ForgeResult<Self> {
        let original = registry.exchange_device(device)?;
        Ok(DeviceGuard {
            registry,
            original,
            current: device,
        })
    }

    /// Switch to another device; the original device is still restored on drop.
    pub fn set_index(&mut self, device: DeviceIndex) -> ForgeResult<()> {
        if device != self.current {
            self.registry.set_device(device)?;
            self.current = device;
        }
        Ok(())
    }

    pub fn original_device(&self) -> DeviceIndex {
        self.original
    }

    pub fn current_device(&self) -> DeviceIndex {
        self.current
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if self.current != self.original {
            self.registry.unchecked_set_device(self.original);
        }
    }
}
