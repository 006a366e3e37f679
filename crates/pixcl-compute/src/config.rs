//! Runtime configuration and environment overrides.
//!
//! # Environment Variables
//!
//! - `PIXCL_KERNEL_ROOT` - Directory scanned for kernel sources
//! - `PIXCL_BACKEND` - Backend to use (`host`, `opencl`, `auto`)
//! - `PIXCL_DEVICE` - Device index for `initialize`
//! - `PIXCL_MEM_MB` - Host device capacity in megabytes

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::driver::Backend;

/// Fixed build profile handed to the driver for every kernel.
pub const BUILD_OPTIONS: &str = "-cl-std=CL1.2 -cl-fast-relaxed-math -cl-kernel-arg-info";

/// Default directory holding kernel sources (relative to the working dir).
pub const DEFAULT_KERNEL_ROOT: &str = "kernels";

/// Subdirectory of the kernel root holding image kernels.
pub const DEFAULT_IMAGING_SUBDIR: &str = "imaging";

/// Cache for system memory detection.
static SYSTEM_MEMORY: OnceLock<u64> = OnceLock::new();

/// Detect total system RAM in bytes.
pub fn system_memory() -> u64 {
    *SYSTEM_MEMORY.get_or_init(|| {
        sys_info::mem_info()
            .map(|m| m.total * 1024) // KB to bytes
            .unwrap_or(8 * 1024 * 1024 * 1024) // 8 GB fallback
    })
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory scanned for kernel sources.
    pub kernel_root: PathBuf,
    /// Subdirectory (of `kernel_root`) holding image kernels.
    pub imaging_subdir: String,
    /// Driver build options.
    pub build_options: String,
    /// Backend selection.
    pub backend: Backend,
    /// Device index used by `initialize` when none is given.
    pub device_index: usize,
    /// Capacity of the host device in bytes (None = system RAM).
    pub host_memory_limit: Option<u64>,
    /// Log stage timings after every successful dispatch.
    pub log_success: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernel_root: PathBuf::from(DEFAULT_KERNEL_ROOT),
            imaging_subdir: DEFAULT_IMAGING_SUBDIR.to_string(),
            build_options: BUILD_OPTIONS.to_string(),
            backend: Backend::Auto,
            device_index: 0,
            host_memory_limit: None,
            log_success: true,
        }
    }
}

impl RuntimeConfig {
    /// Create config with a specific kernel root.
    pub fn with_kernel_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kernel_root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(root) = env_kernel_root() {
            config.kernel_root = root;
        }
        if let Some(backend) = backend_override() {
            config.backend = backend;
        }
        if let Some(index) = env_device() {
            config.device_index = index;
        }
        if let Some(mb) = env_mem_mb() {
            config.host_memory_limit = Some(mb * 1024 * 1024);
        }
        config
    }

    /// Effective capacity of the host device.
    pub fn effective_host_memory(&self) -> u64 {
        self.host_memory_limit.unwrap_or_else(system_memory)
    }
}

/// Get backend override from environment.
pub fn backend_override() -> Option<Backend> {
    env::var("PIXCL_BACKEND")
        .ok()
        .and_then(|v| Backend::from_name(&v))
}

// =============================================================================
// Environment Variable Helpers
// =============================================================================

fn env_kernel_root() -> Option<PathBuf> {
    env::var("PIXCL_KERNEL_ROOT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_device() -> Option<usize> {
    env::var("PIXCL_DEVICE")
        .ok()
        .and_then(|v| v.parse().ok())
}

fn env_mem_mb() -> Option<u64> {
    env::var("PIXCL_MEM_MB")
        .ok()
        .and_then(|v| v.parse().ok())
}

// =============================================================================
// Formatting
// =============================================================================

/// Bytes to whole megabytes (the `readable` flag of the memory queries).
#[inline]
pub fn to_megabytes(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

/// Format bytes as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{} KB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}
