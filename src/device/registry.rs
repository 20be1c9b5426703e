//! Device context registry
//!
//! The native runtime keeps the active device per thread. The first time a
//! device is activated the runtime creates its primary context; the registry
//! captures that context once and remembers the device as "used" so shutdown
//! can reset exactly the devices this process touched.
//!
//! Activation of an already-registered device is lock free: a bitmask of
//! registered indices is checked before the context map's mutex is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::acl_backend::{
    DeviceDriver, DeviceIndex, DeviceProperties, MemInfo, NativeContext,
};
use crate::device::DeviceGuard;
use crate::error::{ForgeResult, NpuForgeError};

/// Devices at or above this index skip the lock-free fast path.
const FAST_PATH_DEVICES: DeviceIndex = 64;

/// Reaction to synchronizing calls (stream/event/device synchronize).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDebugMode {
    #[default]
    Disabled,
    Warn,
    Error,
}

impl SyncDebugMode {
    pub fn as_level(&self) -> i32 {
        match self {
            SyncDebugMode::Disabled => 0,
            SyncDebugMode::Warn => 1,
            SyncDebugMode::Error => 2,
        }
    }

    pub fn from_level(level: i32) -> ForgeResult<Self> {
        match level {
            0 => Ok(SyncDebugMode::Disabled),
            1 => Ok(SyncDebugMode::Warn),
            2 => Ok(SyncDebugMode::Error),
            other => Err(NpuForgeError::InvalidArgument(format!(
                "invalid sync debug mode {}, expected 0 (disabled), 1 (warn) or 2 (error)",
                other
            ))),
        }
    }
}

fn device_bit(device: DeviceIndex) -> Option<u64> {
    if (0..FAST_PATH_DEVICES).contains(&device) {
        Some(1u64 << device)
    } else {
        None
    }
}

/// Process-wide map from device index to its primary context.
pub struct DeviceRegistry {
    driver: Arc<dyn DeviceDriver>,
    registered: AtomicU64,
    contexts: Mutex<HashMap<DeviceIndex, NativeContext>>,
    device_count: OnceCell<DeviceIndex>,
    properties: Mutex<HashMap<DeviceIndex, DeviceProperties>>,
    sync_debug_mode: AtomicU8,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("driver", &self.driver.name())
            .field("registered", &format_args!("{:#b}", self.registered.load(Ordering::Relaxed)))
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        DeviceRegistry {
            driver,
            registered: AtomicU64::new(0),
            contexts: Mutex::new(HashMap::new()),
            device_count: OnceCell::new(),
            properties: Mutex::new(HashMap::new()),
            sync_debug_mode: AtomicU8::new(0),
        }
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Number of visible devices, queried once.
    ///
    /// Never fails: a runtime error is logged and reported as zero devices.
    pub fn device_count(&self) -> DeviceIndex {
        *self.device_count.get_or_init(|| match self.driver.device_count() {
            Ok(count) => count as DeviceIndex,
            Err(err) => {
                tracing::warn!("Device count query failed, assuming no devices: {}", err);
                0
            }
        })
    }

    pub fn device_count_ensure_non_zero(&self) -> ForgeResult<DeviceIndex> {
        match self.device_count() {
            0 => Err(NpuForgeError::PreconditionFailed(
                "no NPU devices are available".to_string(),
            )),
            count => Ok(count),
        }
    }

    /// Fail with `InvalidDevice` unless `device` is in `[0, device_count)`.
    pub fn check_device(&self, device: DeviceIndex) -> ForgeResult<()> {
        let count = self.device_count();
        if device < 0 || device >= count {
            return Err(NpuForgeError::InvalidDevice {
                index: device,
                count,
            });
        }
        Ok(())
    }

    /// Active device of the calling thread.
    ///
    /// A thread that never selected a device gets device 0, activated on the
    /// spot.
    pub fn current_device(&self) -> ForgeResult<DeviceIndex> {
        match self.driver.get_device() {
            Ok(device) => Ok(device),
            Err(err) if err.is_context_null() => {
                tracing::debug!("No device active on this thread, defaulting to device 0");
                self.set_device(0)?;
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Activate `device` on the calling thread, registering it on first use.
    pub fn set_device(&self, device: DeviceIndex) -> ForgeResult<()> {
        self.check_device(device)?;
        self.driver.set_device(device)?;

        if let Some(bit) = device_bit(device) {
            if self.registered.load(Ordering::Acquire) & bit != 0 {
                return Ok(());
            }
        }

        let mut contexts = self.contexts.lock()?;
        if !contexts.contains_key(&device) {
            let context = self.driver.current_context()?;
            tracing::debug!("Registered device {} with context {:?}", device, context);
            contexts.insert(device, context);
        }
        if let Some(bit) = device_bit(device) {
            self.registered.fetch_or(bit, Ordering::Release);
        }
        Ok(())
    }

    /// Activate `device` and return the previously active one.
    pub fn exchange_device(&self, device: DeviceIndex) -> ForgeResult<DeviceIndex> {
        let previous = self.current_device()?;
        if previous != device {
            self.set_device(device)?;
        }
        Ok(previous)
    }

    /// Activate `device`, logging instead of failing.
    pub fn unchecked_set_device(&self, device: DeviceIndex) {
        if let Err(err) = self.set_device(device) {
            tracing::warn!("Failed to restore device {}: {}", device, err);
        }
    }

    pub fn has_primary_context(&self, device: DeviceIndex) -> bool {
        if let Some(bit) = device_bit(device) {
            if self.registered.load(Ordering::Acquire) & bit != 0 {
                return true;
            }
        }
        self.contexts
            .lock()
            .map(|contexts| contexts.contains_key(&device))
            .unwrap_or(false)
    }

    /// Captured context of `device`, if it was ever activated.
    pub fn get_context(&self, device: DeviceIndex) -> ForgeResult<Option<NativeContext>> {
        let context = self.contexts.lock()?.get(&device).copied();
        if context.is_none() {
            tracing::error!(
                "Device {} has no registered context; call set_device({}) first",
                device,
                device
            );
        }
        Ok(context)
    }

    /// Registered devices in ascending order.
    pub fn used_devices(&self) -> ForgeResult<Vec<DeviceIndex>> {
        let mut devices: Vec<DeviceIndex> = self.contexts.lock()?.keys().copied().collect();
        devices.sort_unstable();
        Ok(devices)
    }

    /// Reset every registered device, in ascending order.
    ///
    /// Stops at the first native failure. Devices reset before the failure
    /// are removed from the registry and listed in the returned
    /// [`NpuForgeError::PartialReset`]; the failing device and everything
    /// after it stay registered.
    pub fn reset_all(&self) -> ForgeResult<()> {
        let devices = self.used_devices()?;
        let mut reset = Vec::with_capacity(devices.len());
        for device in devices {
            if let Err(source) = self.driver.reset_device(device) {
                tracing::error!("Reset of device {} failed: {}", device, source);
                return Err(NpuForgeError::PartialReset {
                    failed_device: device,
                    reset,
                    source,
                });
            }
            self.contexts.lock()?.remove(&device);
            if let Some(bit) = device_bit(device) {
                self.registered.fetch_and(!bit, Ordering::AcqRel);
            }
            tracing::debug!("Reset device {}", device);
            reset.push(device);
        }
        Ok(())
    }

    /// Block until the calling thread's device is idle.
    pub fn synchronize_device(&self) -> ForgeResult<()> {
        self.warn_or_error_on_sync()?;
        self.current_device()?;
        self.driver.synchronize_device()?;
        Ok(())
    }

    /// Block until every registered device is idle.
    ///
    /// The caller's active device is restored afterwards, also on failure.
    pub fn synchronize_all(&self) -> ForgeResult<()> {
        self.warn_or_error_on_sync()?;
        let devices = self.used_devices()?;
        let Some(&first) = devices.first() else {
            return Ok(());
        };
        let mut guard = DeviceGuard::new(self, first)?;
        for device in devices {
            guard.set_index(device)?;
            self.driver.synchronize_device()?;
        }
        Ok(())
    }

    /// Name and memory size of `device`, cached after the first query.
    pub fn device_properties(&self, device: DeviceIndex) -> ForgeResult<DeviceProperties> {
        self.check_device(device)?;
        let mut cache = self.properties.lock()?;
        if let Some(props) = cache.get(&device) {
            return Ok(props.clone());
        }
        let props = self.driver.device_properties(device)?;
        cache.insert(device, props.clone());
        Ok(props)
    }

    /// Free and total memory of `device`.
    pub fn mem_get_info(&self, device: DeviceIndex) -> ForgeResult<MemInfo> {
        let _guard = DeviceGuard::new(self, device)?;
        Ok(self.driver.mem_get_info()?)
    }

    pub fn sync_debug_mode(&self) -> SyncDebugMode {
        match self.sync_debug_mode.load(Ordering::Relaxed) {
            1 => SyncDebugMode::Warn,
            2 => SyncDebugMode::Error,
            _ => SyncDebugMode::Disabled,
        }
    }

    pub fn set_sync_debug_mode(&self, mode: SyncDebugMode) {
        self.sync_debug_mode
            .store(mode.as_level() as u8, Ordering::Relaxed);
    }

    /// Apply the sync debug mode to a synchronizing call.
    pub fn warn_or_error_on_sync(&self) -> ForgeResult<()> {
        match self.sync_debug_mode() {
            SyncDebugMode::Disabled => Ok(()),
            SyncDebugMode::Warn => {
                tracing::warn!("called a synchronizing NPU operation");
                Ok(())
            }
            SyncDebugMode::Error => Err(NpuForgeError::SyncDebugViolation(
                "called a synchronizing NPU operation".to_string(),
            )),
        }
    }
}
