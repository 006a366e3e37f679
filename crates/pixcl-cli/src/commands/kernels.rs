//! Kernel listing.

use anyhow::Result;
use pixcl_compute::{ComputeService, DeviceDriver};

use crate::KernelsArgs;

/// Lists kernel files; with `--schema`, compiles each and prints its parameters.
pub fn run<D: DeviceDriver>(service: &ComputeService<D>, args: KernelsArgs) -> Result<()> {
    let kernels = service.list_kernels()?;
    if kernels.is_empty() {
        println!(
            "No kernels under {}",
            service.config().kernel_root.join(&service.config().imaging_subdir).display()
        );
        return Ok(());
    }

    let runtime = service.runtime()?;
    for kernel in &kernels {
        println!("{:<24} {}", kernel.name, kernel.path.display());
        if !args.schema {
            continue;
        }
        match runtime.compiler().load_path(&kernel.path) {
            Some(compiled) => println!("  ({})", compiled.schema().describe()),
            None => println!("  (build failed, run with -v for the build log)"),
        }
    }
    Ok(())
}
