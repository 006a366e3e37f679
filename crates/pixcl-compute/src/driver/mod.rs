//! Device drivers for kernel compilation, memory and dispatch.
//!
//! Provides a host (rayon) reference device and an OpenCL device behind a
//! common [`DeviceDriver`] trait.
//!
//! # Architecture
//!
//! ```text
//! DeviceDriver
//!     +-- HostDriver   (native Rust kernels, rayon parallelization)
//!     +-- OpenClDriver (opencl3, feature "opencl")
//! ```
//!
//! Everything above this layer (registry, compiler, executor) is generic
//! over the driver and never names a concrete backend.

mod detect;
mod host;
mod host_kernels;

#[cfg(feature = "opencl")]
mod opencl;

pub use detect::{detect_backends, select_best_backend, describe_backends, BackendInfo};
pub use host::{HostBuffer, HostDriver, HostDriverBuilder, HostKernel, HostKernelFn, HostLaunch};

#[cfg(feature = "opencl")]
pub use opencl::{OpenClBuffer, OpenClDriver, OpenClKernel};

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

pub use crate::schema::Scalar;
use crate::config::RuntimeConfig;
use crate::ComputeResult;

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Backend {
    /// Auto-select best available (OpenCL > Host).
    #[default]
    Auto,
    /// Host reference device (rayon).
    Host,
    /// OpenCL device.
    OpenCl,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Host => true,
            #[cfg(feature = "opencl")]
            Self::OpenCl => !OpenClDriver::enumerate().is_empty(),
            #[cfg(not(feature = "opencl"))]
            Self::OpenCl => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Host => "host",
            Self::OpenCl => "opencl",
        }
    }

    /// Parse a backend name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "host" | "cpu" => Some(Self::Host),
            "opencl" | "cl" => Some(Self::OpenCl),
            _ => None,
        }
    }
}

/// Description of one compute device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDescriptor {
    /// Index in the backend's enumeration order.
    pub index: usize,
    /// Device name.
    pub name: String,
    /// Device vendor.
    pub vendor: String,
    /// Platform name.
    pub platform: String,
    /// Global memory size in bytes.
    pub global_memory: u64,
    /// Maximum work-group size.
    pub max_work_group_size: usize,
    /// Backend serving this device.
    pub backend: Backend,
}

/// Type spelling and name of one kernel parameter, as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    /// Type spelling (e.g. `uchar*`, `int`).
    pub type_name: String,
    /// Parameter name.
    pub name: String,
}

/// A value ready to be bound to a kernel parameter slot.
///
/// Closed set: the binder in every driver matches it exhaustively.
pub enum KernelArg<B> {
    /// Native device buffer.
    Buffer(Arc<B>),
    /// Scalar or vector value.
    Scalar(Scalar),
}

impl<B> Clone for KernelArg<B> {
    fn clone(&self) -> Self {
        match self {
            Self::Buffer(b) => Self::Buffer(Arc::clone(b)),
            Self::Scalar(s) => Self::Scalar(*s),
        }
    }
}

impl<B> fmt::Debug for KernelArg<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(_) => f.write_str("Buffer"),
            Self::Scalar(s) => write!(f, "{:?}", s),
        }
    }
}

/// Iteration space of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchGeometry {
    /// 1D over `n` work items.
    Linear(usize),
    /// 2D over `width` x `height` work items.
    Planar { width: usize, height: usize },
}

impl DispatchGeometry {
    /// Derive geometry for an RGBA image buffer.
    ///
    /// Both extents positive => 2D; otherwise 1D over the pixel count
    /// inferred from a 4-channel layout (`element_count / 4`).
    pub fn for_image(width: i64, height: i64, element_count: usize) -> Self {
        if width > 0 && height > 0 {
            Self::Planar { width: width as usize, height: height as usize }
        } else {
            Self::Linear(element_count / 4)
        }
    }

    /// Number of dimensions (1 or 2).
    pub fn dimensions(&self) -> u32 {
        match self {
            Self::Linear(_) => 1,
            Self::Planar { .. } => 2,
        }
    }

    /// Global work size per dimension.
    pub fn global_work_size(&self) -> Vec<usize> {
        match *self {
            Self::Linear(n) => vec![n],
            Self::Planar { width, height } => vec![width, height],
        }
    }

    /// Total work items.
    pub fn work_items(&self) -> usize {
        match *self {
            Self::Linear(n) => n,
            Self::Planar { width, height } => width * height,
        }
    }
}

/// Native compute API consumed by the runtime.
///
/// Buffers and kernels release their native resources on `Drop`.
pub trait DeviceDriver: Send + Sync + Sized + 'static {
    /// Native device buffer.
    type Buffer: Send + Sync + 'static;
    /// Native compiled kernel (argument slots are mutable state).
    type Kernel: Send + 'static;

    /// Backend implemented by this driver.
    const BACKEND: Backend;

    /// Enumerate devices; empty when the runtime is missing.
    fn enumerate() -> Vec<DeviceDescriptor>;

    /// Open device `index` (context + queue).
    fn open(index: usize, config: &RuntimeConfig) -> ComputeResult<Self>;

    /// Opened device.
    fn descriptor(&self) -> &DeviceDescriptor;

    /// Allocate a buffer initialized with `bytes`.
    fn create_buffer(&self, bytes: &[u8]) -> ComputeResult<Self::Buffer>;

    /// Blocking read of the whole buffer into `out`.
    fn read_buffer(&self, buffer: &Self::Buffer, out: &mut [u8]) -> ComputeResult<()>;

    /// Build `source` and create kernel `name` from it.
    ///
    /// Build failures carry the driver's diagnostics in
    /// [`ComputeError::KernelBuild`](crate::ComputeError::KernelBuild).
    fn build_kernel(&self, source: &str, name: &str, options: &str) -> ComputeResult<Self::Kernel>;

    /// Number of kernel parameters.
    fn kernel_arg_count(&self, kernel: &Self::Kernel) -> ComputeResult<u32>;

    /// Type spelling and name of parameter `index`.
    fn kernel_arg_info(&self, kernel: &Self::Kernel, index: u32) -> ComputeResult<ArgInfo>;

    /// Bind `arg` to parameter `index`.
    fn set_kernel_arg(&self, kernel: &mut Self::Kernel, index: u32, arg: &KernelArg<Self::Buffer>) -> ComputeResult<()>;

    /// Submit one launch, wait for completion and release the event.
    fn dispatch(&self, kernel: &mut Self::Kernel, geometry: &DispatchGeometry) -> ComputeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_planar() {
        let g = DispatchGeometry::for_image(1920, 1080, 1920 * 1080 * 4);
        assert_eq!(g.dimensions(), 2);
        assert_eq!(g.global_work_size(), vec![1920, 1080]);
    }

    #[test]
    fn test_geometry_linear() {
        let g = DispatchGeometry::for_image(0, 0, 8_294_400);
        assert_eq!(g.dimensions(), 1);
        assert_eq!(g.global_work_size(), vec![2_073_600]);
    }

    #[test]
    fn test_geometry_one_extent_missing() {
        let g = DispatchGeometry::for_image(640, 0, 640 * 4 * 10);
        assert_eq!(g, DispatchGeometry::Linear(6400));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(Backend::from_name("HOST"), Some(Backend::Host));
        assert_eq!(Backend::from_name("opencl"), Some(Backend::OpenCl));
        assert_eq!(Backend::from_name("vulkan"), None);
        assert!(Backend::Host.is_available());
    }
}
