//! Device-compute runtime for per-pixel image kernels.
//!
//! Offloads image transforms to a compute device without any compile-time
//! knowledge of which kernel will run: kernels are discovered from source
//! files, their calling convention is inferred from the driver (or from the
//! source text), and image metadata is bound to parameters by name.
//!
//! # Architecture
//!
//! ```text
//! ComputeService (facade for an API layer)
//!     ├── ImageCollection ──> ImageObject (host/device residency)
//!     └── Runtime<D: DeviceDriver>
//!             ├── BufferRegistry   (handle-based device memory)
//!             ├── KernelCompiler   (discovery, schema, cache)
//!             └── KernelExecutor   (geometry, argument merge, dispatch)
//!                     └── DeviceDriver
//!                             ├── HostDriver   (rayon reference device)
//!                             └── OpenClDriver (feature "opencl")
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pixcl_compute::{ComputeService, HostDriver, ImageObject, RuntimeConfig};
//!
//! let service = ComputeService::<HostDriver>::new(RuntimeConfig::from_env());
//! service.initialize(0)?;
//! let id = service.images().add(ImageObject::blank(800, 600));
//! service.execute_image_kernel(id, "mandelbrot", "00", &[1.1f32.into()])?;
//! ```

pub mod config;
pub mod driver;
pub mod registry;
pub mod schema;
pub mod compiler;
pub mod executor;
pub mod image;
pub mod collection;
pub mod service;
#[cfg(feature = "io")]
pub mod codec;

pub use config::{RuntimeConfig, format_bytes};
pub use driver::{
    ArgInfo, Backend, DeviceDescriptor, DeviceDriver, DispatchGeometry, KernelArg, Scalar,
    HostDriver, HostDriverBuilder, detect_backends, select_best_backend, describe_backends,
};
#[cfg(feature = "opencl")]
pub use driver::OpenClDriver;
pub use registry::{BufferHandle, BufferRegistry, DeviceElement, ElementType, MemoryRecord};
pub use schema::{KernelDeclaration, ParamType, Parameter, ParameterSchema, ScalarKind};
pub use compiler::{CompiledKernel, KernelCompiler};
pub use executor::{ArgValue, ImageMeta, KernelExecutor, plan_arguments};
pub use image::{ImageId, ImageObject, Residency};
pub use collection::{ImageCollection, SharedImage};
pub use service::{
    ComputeService, ErrorKind, ImageInfo, KernelInfo, MemoryStats, Runtime, ServiceError, ServiceResult,
};
#[cfg(feature = "io")]
pub use codec::ExportFormat;

use thiserror::Error;

/// Device compute errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("No compute device found")]
    NoDevice,

    #[error("Invalid device index {index} ({count} devices available)")]
    DeviceIndex { index: usize, count: usize },

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device context: {0}")]
    DeviceCreation(String),

    #[error("Failed to create buffer: {0}")]
    BufferCreation(String),

    #[error("Failed to read buffer: {0}")]
    BufferRead(String),

    #[error("Failed to build kernel '{kernel}':\n{log}")]
    KernelBuild { kernel: String, log: String },

    #[error("Kernel argument info unavailable: {0}")]
    ArgumentInfo(String),

    #[error("Failed to set kernel argument {index}: {message}")]
    KernelArgument { index: u32, message: String },

    #[error("Kernel dispatch failed: {0}")]
    Dispatch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),
}

pub type ComputeResult<T> = Result<T, ComputeError>;
