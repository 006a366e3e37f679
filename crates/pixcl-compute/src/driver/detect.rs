//! Backend detection and auto-selection.

use super::Backend;

/// Information about a compute backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Backend type.
    pub backend: Backend,
    /// Human-readable name.
    pub name: &'static str,
    /// Whether backend is available.
    pub available: bool,
    /// Number of devices it exposes.
    pub devices: usize,
    /// Priority for auto-selection (higher = preferred).
    pub priority: u32,
    /// Description.
    pub description: &'static str,
}

/// Detect all available backends.
pub fn detect_backends() -> Vec<BackendInfo> {
    let mut backends = vec![
        BackendInfo {
            backend: Backend::Host,
            name: "Host",
            available: true,
            devices: 1,
            priority: 10,
            description: "Host reference device with rayon parallelization",
        },
    ];

    #[cfg(feature = "opencl")]
    {
        use super::DeviceDriver;

        let devices = super::OpenClDriver::enumerate().len();
        backends.push(BackendInfo {
            backend: Backend::OpenCl,
            name: "OpenCL",
            available: devices > 0,
            devices,
            priority: if devices > 0 { 100 } else { 0 },
            description: "GPU/CPU devices via OpenCL",
        });
    }

    backends.sort_by(|a, b| b.priority.cmp(&a.priority));
    backends
}

/// Select the best available backend.
pub fn select_best_backend() -> Backend {
    detect_backends()
        .into_iter()
        .filter(|b| b.available)
        .max_by_key(|b| b.priority)
        .map(|b| b.backend)
        .unwrap_or(Backend::Host)
}

/// Get description of available backends.
pub fn describe_backends() -> String {
    let mut desc = String::new();

    for info in detect_backends() {
        let status = if info.available { "+" } else { "-" };
        desc.push_str(&format!(
            "[{}] {}: {} ({} device(s))\n",
            status, info.name, info.description, info.devices
        ));
    }

    desc
}
