//! tilevmm - attaches to an on-die RISC-V L2CPU cluster, exposes its
//! virtual UART as a console, and emulates virtio-mmio block and
//! network devices so an unmodified guest kernel boots against what
//! looks like an ordinary virtio platform.
//!
//! CLI shape and the overall "parse args, then hand off to the device
//! host" structure are carried over from the teacher's `main.rs`;
//! everything below the argument parsing is new, grounded on
//! `original_source/console/tt-bh-linux.cpp`'s `main` via
//! [`orchestrator::run`].

mod cluster;
mod console;
mod ddi;
mod orchestrator;
mod tlb;
mod virtio;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use ddi::DeviceHandle;
use orchestrator::RunConfig;
use tlb::TlbPool;

const DEFAULT_SSH_PORT_BASE: u16 = 2222;

#[derive(Parser, Debug)]
#[command(name = "tilevmm")]
#[command(about = "Attach to an L2CPU cluster and emulate its virtio console/block/network devices")]
struct Args {
    /// Device node for the accelerator's kernel driver.
    #[arg(long, default_value = "/dev/tenstorrent/0")]
    device: String,

    /// Which of the four on-die L2CPU clusters to attach to.
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    l2cpu: u8,

    /// Path to the primary disk image.
    #[arg(long, default_value = "rootfs.ext4")]
    disk: String,

    /// Optional second block device for cloud-init seed data.
    #[arg(long)]
    cloud_init: Option<String>,

    /// Host port forwarded to the guest's SSH listener. Defaults to
    /// 2222 plus the cluster index.
    #[arg(long)]
    ssh_port: Option<u16>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            };
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("[tilevmm] attaching to l2cpu {}", args.l2cpu);
    eprintln!("[tilevmm] disk: {}", args.disk);
    if let Some(ref cloud_init) = args.cloud_init {
        eprintln!("[tilevmm] cloud-init: {cloud_init}");
    }

    let ssh_port = args
        .ssh_port
        .unwrap_or(DEFAULT_SSH_PORT_BASE + args.l2cpu as u16);
    eprintln!("[tilevmm] ssh port forward: {ssh_port}");

    let handle = DeviceHandle::open(&args.device)?;
    let pool = Arc::new(TlbPool::with_default_capacity(Arc::new(handle)));

    let config = RunConfig {
        l2cpu: args.l2cpu,
        disk_path: args.disk,
        cloud_init_path: args.cloud_init,
        ssh_port,
    };

    orchestrator::run(pool, config)?;
    Ok(())
}
