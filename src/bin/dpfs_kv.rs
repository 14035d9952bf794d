//! Key-value dataplane: presents a host-visible virtio-fs function whose
//! files live in an in-memory key-value store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::error;

use dpfs::hal::queue::QueueDevice;
use dpfs::hal::{Device, Hal, RequestHandler};
use dpfs::kv::KvFs;
use dpfs::{Config, FuseDispatcher};

#[derive(Parser)]
#[command(name = "dpfs-kv", about = "virtio-fs dataplane backed by a key-value store")]
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
    if config.kv.is_none() {
        error!("config is missing the [kv] table");
        return ExitCode::FAILURE;
    }

    let handler: Arc<dyn RequestHandler> = Arc::new(FuseDispatcher::new(KvFs::new()));
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
