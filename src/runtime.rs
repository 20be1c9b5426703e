//! Process-level runtime: registry, stream pools and the allocator slot

use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::allocator::{AllocatorConfig, DataPtr, NpuAllocator, NpuCachingAllocator};
use crate::backend::acl_backend::DeviceDriver;
use crate::device::DeviceRegistry;
use crate::error::ForgeResult;
use crate::guard::NpuGuardImpl;
use crate::precondition_error;
use crate::stream::{NpuStream, StreamPool};

static GLOBAL_RUNTIME: OnceCell<Arc<NpuRuntime>> = OnceCell::new();

/// Owns one registry, its stream pools, the native caching allocator and
/// the allocator currently used for new allocations.
pub struct NpuRuntime {
    registry: Arc<DeviceRegistry>,
    streams: Arc<StreamPool>,
    caching_allocator: Arc<NpuCachingAllocator>,
    current_allocator: RwLock<Arc<dyn NpuAllocator>>,
}

impl std::fmt::Debug for NpuRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self
            .current_allocator
            .read()
            .map(|a| a.name())
            .unwrap_or("<poisoned>");
        f.debug_struct("NpuRuntime")
            .field("registry", &self.registry)
            .field("current_allocator", &current)
            .finish()
    }
}

impl NpuRuntime {
    /// Build a runtime over `driver`.
    ///
    /// The native allocator is initialized lazily, on the first call that
    /// goes through [`NpuRuntime::current_allocator`].
    pub fn new(driver: Arc<dyn DeviceDriver>, config: AllocatorConfig) -> ForgeResult<Self> {
        config.validate()?;
        let registry = Arc::new(DeviceRegistry::new(driver));
        let streams = Arc::new(StreamPool::new(registry.clone()));
        let caching_allocator = Arc::new(NpuCachingAllocator::new(
            registry.clone(),
            streams.clone(),
            config,
        ));
        tracing::info!(
            "NPU runtime on {} driver with {} device(s)",
            registry.driver().name(),
            registry.device_count()
        );
        Ok(NpuRuntime {
            registry,
            streams,
            current_allocator: RwLock::new(caching_allocator.clone() as Arc<dyn NpuAllocator>),
            caching_allocator,
        })
    }

    /// Make `runtime` the process-wide instance. Fails if one is installed.
    pub fn install(runtime: NpuRuntime) -> ForgeResult<Arc<NpuRuntime>> {
        let runtime = Arc::new(runtime);
        GLOBAL_RUNTIME
            .set(runtime.clone())
            .map_err(|_| precondition_error!("an NPU runtime is already installed"))?;
        Ok(runtime)
    }

    /// The process-wide instance, created on first use with the ACL driver
    /// and `NPUFORGE_ALLOC_CONF`.
    #[cfg(feature = "acl")]
    pub fn global() -> ForgeResult<Arc<NpuRuntime>> {
        GLOBAL_RUNTIME
            .get_or_try_init(|| {
                let driver = Arc::new(crate::backend::acl_backend::AclDriver::new()?);
                let runtime = NpuRuntime::new(driver, AllocatorConfig::from_env()?)?;
                Ok(Arc::new(runtime))
            })
            .cloned()
    }

    /// The installed process-wide instance.
    #[cfg(not(feature = "acl"))]
    pub fn global() -> ForgeResult<Arc<NpuRuntime>> {
        GLOBAL_RUNTIME
            .get()
            .cloned()
            .ok_or_else(|| precondition_error!("no NPU runtime installed; call NpuRuntime::install"))
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &Arc<StreamPool> {
        &self.streams
    }

    /// The native allocator, whether or not it is current.
    pub fn caching_allocator(&self) -> &Arc<NpuCachingAllocator> {
        &self.caching_allocator
    }

    /// Capability adapter over this runtime.
    pub fn guard_impl(&self) -> NpuGuardImpl {
        NpuGuardImpl::new(self.streams.clone())
    }

    /// The allocator used for new allocations, initialized if needed.
    pub fn current_allocator(&self) -> ForgeResult<Arc<dyn NpuAllocator>> {
        let allocator = self.current_allocator.read()?.clone();
        if !allocator.initialized() {
            allocator.init(self.registry.device_count())?;
        }
        Ok(allocator)
    }

    /// Route new allocations to `allocator`.
    ///
    /// Refused once the current allocator has been initialized: pointers it
    /// handed out must be freed by it.
    pub fn change_current_allocator(&self, allocator: Arc<dyn NpuAllocator>) -> ForgeResult<()> {
        let mut current = self.current_allocator.write()?;
        if current.initialized() {
            return Err(precondition_error!(
                "cannot replace the {} allocator after it has been initialized",
                current.name()
            ));
        }
        tracing::info!("Current allocator changed from {} to {}", current.name(), allocator.name());
        *current = allocator;
        Ok(())
    }

    /// Allocate `size` bytes on the current stream of the current device.
    pub fn allocate(&self, size: usize) -> ForgeResult<DataPtr> {
        let stream = self.streams.current_stream(None)?;
        self.allocate_on(size, &stream)
    }

    pub fn allocate_on(&self, size: usize, stream: &NpuStream) -> ForgeResult<DataPtr> {
        let allocator = self.current_allocator()?;
        let ptr = allocator.raw_alloc_with_stream(size, stream)?;
        Ok(DataPtr::new(ptr, size, stream.device_index(), allocator))
    }

    /// Wait for all devices, destroy pooled streams, release cached memory
    /// and reset every used device.
    ///
    /// Live allocations are not freed; cached segments with live blocks stay
    /// reserved until the devices are reset.
    pub fn shutdown(&self) -> ForgeResult<()> {
        tracing::info!("Shutting down NPU runtime");
        if let Err(err) = self.registry.synchronize_all() {
            tracing::warn!("Device synchronization during shutdown failed: {}", err);
        }
        let allocator = self.current_allocator.read()?.clone();
        if let Err(err) = allocator.empty_cache() {
            tracing::warn!("Emptying the allocator cache during shutdown failed: {}", err);
        }
        self.streams.destroy_all_streams();
        self.registry.reset_all()
    }
}
