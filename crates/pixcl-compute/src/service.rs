//! Operation facade for an API layer.
//!
//! [`ComputeService`] owns the image collection and, once a device is
//! initialized, a [`Runtime`] (driver + registry + compiler + executor).
//! Every operation returns a serializable payload or a [`ServiceError`]
//! whose [`ErrorKind`] the caller maps to its own status codes.
//!
//! # Example
//!
//! ```ignore
//! let service = ComputeService::<HostDriver>::new(RuntimeConfig::from_env());
//! service.initialize(0)?;
//! let id = service.images().pop_empty(800, 600);
//! let info = service.execute_image_kernel(id, "mandelbrot", "00", &[1.1f64.into()])?;
//! assert_eq!(info.residency, "host");
//! ```

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::collection::ImageCollection;
use crate::compiler::KernelCompiler;
use crate::config::RuntimeConfig;
use crate::driver::{DeviceDescriptor, DeviceDriver};
use crate::executor::{ArgValue, KernelExecutor};
use crate::image::{ImageId, ImageObject, Residency};
use crate::registry::{BufferHandle, BufferRegistry};
use crate::ComputeError;

// =============================================================================
// Errors and payloads
// =============================================================================

/// Failure category of a service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    BadRequest,
    Internal,
}

/// Structured service failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ComputeError> for ServiceError {
    fn from(e: ComputeError) -> Self {
        match e {
            ComputeError::NoDevice | ComputeError::DeviceIndex { .. } => Self::NotFound(e.to_string()),
            ComputeError::BackendNotAvailable(_) => Self::BadRequest(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Device memory summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub device: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Live registry records.
    pub buffers: usize,
    /// Values are megabytes instead of bytes.
    pub readable: bool,
}

/// Image summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub id: u64,
    pub name: String,
    pub path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub bit_depth: u32,
    pub size_bytes: u64,
    /// `host`, `device` or `empty`.
    pub residency: &'static str,
    pub device_handle: Option<String>,
}

impl From<&ImageObject> for ImageInfo {
    fn from(img: &ImageObject) -> Self {
        let residency = match img.residency() {
            Residency::Empty => "empty",
            Residency::Host(_) => "host",
            Residency::Device(_) => "device",
        };
        Self {
            id: img.id().as_u64(),
            name: img.name().to_string(),
            path: img.path().map(|p| p.to_path_buf()),
            width: img.width(),
            height: img.height(),
            channels: img.channels(),
            bit_depth: img.bit_depth(),
            size_bytes: img.size_in_bytes(),
            residency,
            device_handle: img.device_handle().map(|h| h.to_string()),
        }
    }
}

/// Discovered kernel file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelInfo {
    pub name: String,
    pub path: PathBuf,
}

// =============================================================================
// Runtime
// =============================================================================

/// Everything bound to one opened device.
pub struct Runtime<D: DeviceDriver> {
    driver: Arc<D>,
    registry: Arc<BufferRegistry<D>>,
    compiler: Arc<KernelCompiler<D>>,
    executor: KernelExecutor<D>,
}

impl<D: DeviceDriver> Runtime<D> {
    /// Wire the components around an opened driver.
    pub fn new(driver: D, config: &RuntimeConfig) -> Self {
        let driver = Arc::new(driver);
        let registry = Arc::new(BufferRegistry::new(Arc::clone(&driver)));
        let compiler = Arc::new(KernelCompiler::new(Arc::clone(&driver), config));
        let executor = KernelExecutor::new(Arc::clone(&registry), Arc::clone(&compiler))
            .with_log_success(config.log_success);
        Self { driver, registry, compiler, executor }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<BufferRegistry<D>> {
        &self.registry
    }

    pub fn compiler(&self) -> &Arc<KernelCompiler<D>> {
        &self.compiler
    }

    pub fn executor(&self) -> &KernelExecutor<D> {
        &self.executor
    }
}

// =============================================================================
// Service
// =============================================================================

/// The operations exposed to an API layer.
pub struct ComputeService<D: DeviceDriver> {
    config: RuntimeConfig,
    images: ImageCollection,
    runtime: RwLock<Option<Arc<Runtime<D>>>>,
}

impl<D: DeviceDriver> ComputeService<D> {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            images: ImageCollection::new(),
            runtime: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn images(&self) -> &ImageCollection {
        &self.images
    }

    /// Devices the driver can open.
    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        D::enumerate()
    }

    /// Open device `index`, replacing any current runtime.
    pub fn initialize(&self, index: usize) -> ServiceResult<DeviceDescriptor> {
        let count = D::enumerate().len();
        if index >= count {
            return Err(ComputeError::DeviceIndex { index, count }.into());
        }

        self.dispose();
        let runtime = Runtime::new(D::open(index, &self.config)?, &self.config);
        let descriptor = runtime.driver.descriptor().clone();
        info!(device = %descriptor.name, index, "device initialized");

        *self.runtime.write().unwrap() = Some(Arc::new(runtime));
        Ok(descriptor)
    }

    /// Open the configured default device.
    pub fn initialize_default(&self) -> ServiceResult<DeviceDescriptor> {
        self.initialize(self.config.device_index)
    }

    /// Pull device-resident images back and drop the runtime.
    pub fn dispose(&self) {
        let Some(runtime) = self.runtime.write().unwrap().take() else {
            return;
        };
        for id in self.images.ids() {
            if let Some(image) = self.images.get(id) {
                let mut image = image.lock().unwrap();
                if image.is_on_device() && !runtime.registry.pull_image(&mut image) {
                    warn!(image = %id, "device pixels lost on dispose");
                    image.dispose();
                }
            }
        }
        info!(device = %runtime.driver.descriptor().name, "device released");
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.read().unwrap().is_some()
    }

    /// Current runtime.
    pub fn runtime(&self) -> ServiceResult<Arc<Runtime<D>>> {
        self.runtime
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| ServiceError::BadRequest("no device initialized".into()))
    }

    pub fn device(&self) -> ServiceResult<DeviceDescriptor> {
        Ok(self.runtime()?.driver.descriptor().clone())
    }

    fn image(&self, id: ImageId) -> ServiceResult<crate::collection::SharedImage> {
        self.images
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(format!("image {}", id)))
    }

    pub fn image_info(&self, id: ImageId) -> ServiceResult<ImageInfo> {
        let image = self.image(id)?;
        let image = image.lock().unwrap();
        Ok(ImageInfo::from(&*image))
    }

    pub fn list_images(&self) -> Vec<ImageInfo> {
        self.images
            .ids()
            .into_iter()
            .filter_map(|id| self.image_info(id).ok())
            .collect()
    }

    /// Toggle residency: host -> device, device -> host.
    pub fn move_image(&self, id: ImageId) -> ServiceResult<ImageInfo> {
        let runtime = self.runtime()?;
        let image = self.image(id)?;
        let mut image = image.lock().unwrap();

        if image.is_empty() {
            return Err(ServiceError::BadRequest(format!("image {} has no pixels", id)));
        }
        if image.is_on_host() {
            if runtime.registry.push_image(&mut image).is_none() {
                return Err(ServiceError::Internal(format!("failed to move image {} to device", id)));
            }
        } else if !runtime.registry.pull_image(&mut image) {
            return Err(ServiceError::Internal(format!("failed to move image {} to host", id)));
        }
        Ok(ImageInfo::from(&*image))
    }

    /// Run kernel `name + version` on an image.
    pub fn execute_image_kernel(
        &self,
        id: ImageId,
        name: &str,
        version: &str,
        params: &[ArgValue],
    ) -> ServiceResult<ImageInfo> {
        let runtime = self.runtime()?;
        let kernel = format!("{}{}", name, version);
        let Some(path) = runtime.compiler.resolve(&kernel) else {
            return Err(ServiceError::NotFound(format!("kernel {}", kernel)));
        };

        let image = self.image(id)?;
        let mut image = image.lock().unwrap();
        if image.is_empty() {
            return Err(ServiceError::BadRequest(format!("image {} has no pixels", id)));
        }
        let Some(compiled) = runtime.compiler.load_path(&path) else {
            return Err(ServiceError::Internal(format!("kernel {} failed to build", kernel)));
        };
        if !runtime.executor.execute_kernel_on_image(&mut image, &compiled, params) {
            return Err(ServiceError::Internal(format!("kernel {} failed on image {}", kernel, id)));
        }
        Ok(ImageInfo::from(&*image))
    }

    pub fn memory_stats(&self, readable: bool) -> ServiceResult<MemoryStats> {
        let runtime = self.runtime()?;
        let registry = &runtime.registry;
        Ok(MemoryStats {
            device: runtime.driver.descriptor().name.clone(),
            total: registry.memory_total(readable),
            used: registry.memory_used(readable),
            free: registry.memory_free(readable),
            buffers: registry.len(),
            readable,
        })
    }

    /// Kernel files under the imaging directory.
    pub fn list_kernels(&self) -> ServiceResult<Vec<KernelInfo>> {
        let runtime = self.runtime()?;
        Ok(runtime
            .compiler
            .list_kernel_files(&self.config.imaging_subdir)
            .into_iter()
            .map(|(path, name)| KernelInfo { name, path })
            .collect())
    }

    /// Live device buffers.
    pub fn buffer_handles(&self) -> ServiceResult<Vec<BufferHandle>> {
        Ok(self.runtime()?.registry.handles())
    }

    /// Write an image to disk, pulling it from the device first if needed.
    #[cfg(feature = "io")]
    pub fn export_image(&self, id: ImageId, path: &std::path::Path) -> ServiceResult<()> {
        let image = self.image(id)?;
        let mut image = image.lock().unwrap();
        if image.is_on_device() {
            let runtime = self.runtime()?;
            if !runtime.registry.pull_image(&mut image) {
                return Err(ServiceError::Internal(format!("failed to pull image {}", id)));
            }
        }
        if !image.is_on_host() {
            return Err(ServiceError::BadRequest(format!("image {} has no pixels", id)));
        }
        image.export(path, None)?;
        Ok(())
    }
}

impl<D: DeviceDriver> Drop for ComputeService<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostDriver;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ServiceError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        let e: ServiceError = ComputeError::DeviceIndex { index: 4, count: 1 }.into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let e: ServiceError = ComputeError::Dispatch("boom".into()).into();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_requires_initialize() {
        let service = ComputeService::<HostDriver>::new(RuntimeConfig::default());
        assert!(!service.is_initialized());
        assert_eq!(service.memory_stats(false).unwrap_err().kind(), ErrorKind::BadRequest);
        assert_eq!(service.initialize(7).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_move_image_round_trip() {
        let service = ComputeService::<HostDriver>::new(RuntimeConfig::default());
        service.initialize(0).unwrap();
        let id = service.images().pop_empty(8, 4);

        let info = service.move_image(id).unwrap();
        assert_eq!(info.residency, "device");
        assert!(info.device_handle.is_some());
        assert_eq!(service.memory_stats(false).unwrap().used, 128);

        let info = service.move_image(id).unwrap();
        assert_eq!(info.residency, "host");
        assert_eq!(service.memory_stats(false).unwrap().used, 0);
    }

    #[test]
    fn test_dispose_pulls_images_back() {
        let service = ComputeService::<HostDriver>::new(RuntimeConfig::default());
        service.initialize(0).unwrap();
        let id = service.images().pop_empty(2, 2);
        service.move_image(id).unwrap();

        service.dispose();
        assert!(!service.is_initialized());
        assert_eq!(service.image_info(id).unwrap().residency, "host");
    }

    #[test]
    fn test_unknown_image() {
        let service = ComputeService::<HostDriver>::new(RuntimeConfig::default());
        service.initialize(0).unwrap();
        let err = service.move_image(ImageId::from_raw(u64::MAX)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
