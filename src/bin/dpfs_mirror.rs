//! Local-mirror dataplane: presents a host-visible virtio-fs function backed
//! by a directory on this machine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::error;

use dpfs::hal::queue::QueueDevice;
use dpfs::hal::{Device, Hal, RequestHandler};
use dpfs::passthrough::PassthroughFs;
use dpfs::{Config, FuseDispatcher};

#[derive(Parser)]
#[command(name = "dpfs-mirror", about = "virtio-fs dataplane mirroring a local directory")]
struct Args {
    /// Path to the deployment TOML document
    #[arg(short = 'c', value_name = "config_path")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let Some(mirror) = config.local_mirror.clone() else {
        error!("config is missing the [local_mirror] table");
        return ExitCode::FAILURE;
    };

    let fs = match PassthroughFs::new(&mirror, config.snap_hal.nthreads) {
        Ok(fs) => fs,
        Err(e) => {
            error!("cannot mirror {}: {e}", mirror.dir.display());
            return ExitCode::FAILURE;
        }
    };

    let handler: Arc<dyn RequestHandler> = Arc::new(FuseDispatcher::new(Arc::new(fs)));
    let factory_handler = handler.clone();
    let hal = match Hal::new(&config.snap_hal, handler, &move |id, _pf, _tag| {
        Ok(Arc::new(QueueDevice::new(id, factory_handler.clone())) as Arc<dyn Device>)
    }) {
        Ok(hal) => hal,
        Err(e) => {
            error!("failed to initialize the HAL: {e}");
            return ExitCode::FAILURE;
        }
    };

    hal.run();
    ExitCode::SUCCESS
}
