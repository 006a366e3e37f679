//! pixcl - run per-pixel image kernels on a compute device
//!
//! Thin front end over `pixcl-compute`: picks a backend, opens a device and
//! drives the compute service.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "pixcl")]
#[command(author, version, about = "Run image kernels on compute devices")]
#[command(long_about = "
Discovers kernel sources, infers their parameters and runs them over images.

Examples:
  pixcl devices                              # List backends and devices
  pixcl kernels --schema                     # List kernels with parameters
  pixcl run photo.png invert -o out.png      # Run invert00 on an image
  pixcl run photo.png brightness -a 1.4 -o out.png
  pixcl blank 800 600 mandelbrot -a 1.1 -o fractal.png
  pixcl memory                               # Device memory usage
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Backend: auto, host, opencl
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Device index within the backend
    #[arg(short = 'D', long, global = true)]
    device: Option<usize>,

    /// Kernel root directory
    #[arg(short = 'k', long = "kernels", global = true)]
    kernel_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List backends and their devices
    Devices,

    /// List kernel files under the imaging directory
    #[command(visible_alias = "ls")]
    Kernels(KernelsArgs),

    /// Run a kernel on an image file
    Run(RunArgs),

    /// Run a kernel on a blank canvas
    Blank(BlankArgs),

    /// Show device memory usage
    #[command(visible_alias = "mem")]
    Memory(MemoryArgs),
}

#[derive(Args)]
pub struct KernelsArgs {
    /// Compile each kernel and print its parameters
    #[arg(short, long)]
    schema: bool,
}

#[derive(Args)]
pub struct KernelArgs {
    /// Kernel base name (e.g. invert)
    kernel: String,

    /// Kernel version suffix
    #[arg(long, default_value = "00")]
    kernel_version: String,

    /// Kernel argument (repeatable): 42, 1.5, 0.5,0.5
    #[arg(short, long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Output image
    #[arg(short, long)]
    output: PathBuf,

    /// Move the image to the device before running
    #[arg(long)]
    resident: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Input image
    input: PathBuf,

    #[command(flatten)]
    kernel: KernelArgs,
}

#[derive(Args)]
pub struct BlankArgs {
    /// Canvas width (0 = default)
    width: u32,

    /// Canvas height (0 = default)
    height: u32,

    #[command(flatten)]
    kernel: KernelArgs,
}

#[derive(Args)]
pub struct MemoryArgs {
    /// Report whole megabytes instead of bytes
    #[arg(short = 'm', long)]
    megabytes: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    commands::init_logging(cli.verbose);

    let config = commands::build_config(&cli)?;
    match cli.command {
        Commands::Devices => commands::devices::run(),
        command => commands::with_backend(config, command),
    }
}
