//! Device memory report.

use anyhow::Result;
use pixcl_compute::{ComputeService, DeviceDriver, format_bytes};

use crate::MemoryArgs;

pub fn run<D: DeviceDriver>(service: &ComputeService<D>, args: MemoryArgs) -> Result<()> {
    let stats = service.memory_stats(args.megabytes)?;
    let show = |v: u64| if args.megabytes { format!("{} MB", v) } else { format_bytes(v) };

    println!("{}", stats.device);
    println!("  Total:   {}", show(stats.total));
    println!("  Used:    {}", show(stats.used));
    println!("  Free:    {}", show(stats.free));
    println!("  Buffers: {}", stats.buffers);
    Ok(())
}
