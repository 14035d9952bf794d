//! NFS dataplane: presents a host-visible virtio-fs function backed by a
//! remote NFSv4.1 server, one trunked connection per polling thread.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use dpfs::hal::queue::QueueDevice;
use dpfs::hal::{Device, Hal, RequestHandler};
use dpfs::nfs::NfsFs;
use dpfs::{Config, FuseDispatcher};

#[derive(Parser)]
#[command(name = "dpfs-nfs", about = "virtio-fs dataplane backed by a remote NFSv4.1 server")]
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
    let Some(nfs) = config.nfs.clone() else {
        error!("config is missing the [nfs] table");
        return ExitCode::FAILURE;
    };

    info!("connecting to {}:{}", nfs.server, nfs.export);
    let fs = match NfsFs::new(&nfs.server, &nfs.export, config.snap_hal.nthreads) {
        Ok(fs) => fs,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = fs.connect() {
        error!("cannot mount {}:{}: {e}", nfs.server, nfs.export);
        return ExitCode::FAILURE;
    }

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
