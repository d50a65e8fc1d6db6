//! ravel-init: PID 1 inside each microVM.
//!
//! Boot sequence: mount pseudo-filesystems, read the run config shipped in
//! the initrd, configure networking, compute the workload environment, then
//! replace this process with the workload. Anything that fails before the
//! replacement point aborts the boot with a typed reason on the console.

use std::process::ExitCode;

use ravel_init_config::{InitConfig, RUN_CONFIG_PATH};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod environment;
mod error;
mod mount;
mod network;

use error::InitError;

fn main() -> ExitCode {
    // Console logging only; the serial console is the boot log.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ravel-init starting");

    // run() only returns on failure: on success the workload has replaced
    // this process.
    let err = run();
    error!(reason = err.reason_code(), error = %err, "init failed");
    ExitCode::from(1)
}

fn run() -> InitError {
    if let Err(err) = mount::mount_pseudo_filesystems() {
        return err;
    }
    info!("pseudo-filesystems mounted");

    let config = match read_config() {
        Ok(config) => config,
        Err(err) => return err,
    };
    info!(root_device = %config.root_device, "run config loaded");

    if let Err(err) = network::configure(&config.network, &config.etc_resolv) {
        return err;
    }
    info!("network configured");

    let plan = match environment::build_launch_plan(&config) {
        Ok(plan) => plan,
        Err(err) => return err,
    };
    info!(argv = ?plan.argv, working_dir = %plan.working_dir, "launching workload");

    environment::exec_workload(&plan)
}

fn read_config() -> Result<InitConfig, InitError> {
    let bytes = std::fs::read(RUN_CONFIG_PATH)
        .map_err(|err| InitError::ConfigRead(format!("{RUN_CONFIG_PATH}: {err}")))?;
    serde_json::from_slice(&bytes).map_err(|err| InitError::ConfigParse(err.to_string()))
}
