//! Device listing.

use anyhow::Result;
use pixcl_compute::{DeviceDescriptor, DeviceDriver, HostDriver, describe_backends, format_bytes};

/// Prints every backend with the devices it exposes.
pub fn run() -> Result<()> {
    print!("{}", describe_backends());

    println!();
    print_devices("host", &HostDriver::enumerate());
    #[cfg(feature = "opencl")]
    print_devices("opencl", &pixcl_compute::OpenClDriver::enumerate());

    Ok(())
}

fn print_devices(backend: &str, devices: &[DeviceDescriptor]) {
    for d in devices {
        println!("{}:{}  {}", backend, d.index, d.name);
        println!("  Vendor:     {}", d.vendor);
        println!("  Platform:   {}", d.platform);
        println!("  Memory:     {}", format_bytes(d.global_memory));
        println!("  Work group: {}", d.max_work_group_size);
    }
}
