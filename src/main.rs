use anyhow::{Context, Result};
use config::ControlPlaneConfig;

mod catalog;
mod config;
mod control_plane;
mod distribution;
mod error;
mod logging;
mod messaging;
mod pki;
mod registry;
mod runtime;
mod transport;
mod wait;
mod workerpool;

fn main() -> Result<()> {
    let config = ControlPlaneConfig::new().context("parsing config")?;

    logging::init(config.log_level).context("initializing logging")?;

    log::info!("meshctrl {} starting", env!("CARGO_PKG_VERSION"));

    runtime::prepare_tokio_runtime(config.threads)?.block_on(control_plane::run(&config))
}
