//! Kernel runs on image files and blank canvases.

use anyhow::{Context, Result};
use pixcl_compute::{ComputeService, DeviceDriver, ImageId};
use tracing::debug;

use crate::{BlankArgs, KernelArgs, RunArgs};

/// Loads `input`, runs the kernel and writes the result.
pub fn run_file<D: DeviceDriver>(service: &ComputeService<D>, args: RunArgs) -> Result<()> {
    let id = service
        .images()
        .load_image(&args.input)
        .with_context(|| format!("Failed to load: {}", args.input.display()))?;
    execute(service, id, &args.kernel)
}

/// Creates a zero-filled canvas, runs the kernel and writes the result.
pub fn run_blank<D: DeviceDriver>(service: &ComputeService<D>, args: BlankArgs) -> Result<()> {
    let id = service.images().pop_empty(args.width, args.height);
    execute(service, id, &args.kernel)
}

fn execute<D: DeviceDriver>(service: &ComputeService<D>, id: ImageId, args: &KernelArgs) -> Result<()> {
    super::check_kernel_name(&args.kernel)?;
    let params = super::parse_args(&args.args)?;

    if args.resident {
        let info = service.move_image(id)?;
        debug!(image = %id, handle = ?info.device_handle, "image moved to device");
    }

    let info = service
        .execute_image_kernel(id, &args.kernel, &args.kernel_version, &params)
        .with_context(|| format!("Kernel {}{} failed", args.kernel, args.kernel_version))?;

    service
        .export_image(id, &args.output)
        .with_context(|| format!("Failed to save: {}", args.output.display()))?;

    println!(
        "{}{}: {}x{} -> {}",
        args.kernel,
        args.kernel_version,
        info.width,
        info.height,
        args.output.display()
    );
    Ok(())
}
