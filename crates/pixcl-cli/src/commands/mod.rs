//! CLI command implementations

pub mod devices;
pub mod kernels;
pub mod memory;
pub mod run;

use anyhow::{Context, Result, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pixcl_compute::{
    ArgValue, Backend, ComputeService, DeviceDriver, HostDriver, RuntimeConfig, select_best_backend,
};

use crate::{Cli, Commands};

/// Log filter from `PIXCL_LOG`, else from the `-v` count.
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("PIXCL_LOG").unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Environment config with command-line overrides applied.
pub fn build_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::from_env();
    if let Some(name) = &cli.backend {
        config.backend = Backend::from_name(name)
            .with_context(|| format!("Unknown backend '{}' (expected auto, host or opencl)", name))?;
    }
    if let Some(index) = cli.device {
        config.device_index = index;
    }
    if let Some(root) = &cli.kernel_root {
        config.kernel_root = root.clone();
    }
    config.log_success = cli.verbose > 0;
    Ok(config)
}

/// Resolve the configured backend and run `command` on its default device.
pub fn with_backend(config: RuntimeConfig, command: Commands) -> Result<()> {
    let backend = match config.backend {
        Backend::Auto => select_best_backend(),
        other => other,
    };
    info!(backend = backend.name(), "backend selected");

    match backend {
        #[cfg(feature = "opencl")]
        Backend::OpenCl => dispatch::<pixcl_compute::OpenClDriver>(config, command),
        #[cfg(not(feature = "opencl"))]
        Backend::OpenCl => bail!("OpenCL support not compiled in (rebuild with --features opencl)"),
        Backend::Host | Backend::Auto => dispatch::<HostDriver>(config, command),
    }
}

fn dispatch<D: DeviceDriver>(config: RuntimeConfig, command: Commands) -> Result<()> {
    let service = ComputeService::<D>::new(config);
    let device = service
        .initialize_default()
        .context("Failed to open compute device")?;
    info!(device = %device.name, backend = device.backend.name(), "device ready");

    match command {
        Commands::Devices => devices::run(),
        Commands::Kernels(args) => kernels::run(&service, args),
        Commands::Run(args) => run::run_file(&service, args),
        Commands::Blank(args) => run::run_blank(&service, args),
        Commands::Memory(args) => memory::run(&service, args),
    }
}

/// Parse `--arg` values into kernel arguments.
pub fn parse_args(raw: &[String]) -> Result<Vec<ArgValue>> {
    raw.iter()
        .map(|s| s.parse::<ArgValue>().map_err(anyhow::Error::msg))
        .collect()
}

/// Reject empty kernel names early.
pub fn check_kernel_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(char::is_whitespace) {
        bail!("Invalid kernel name '{}'", name);
    }
    Ok(())
}
