//! Command implementations.

use crate::api::{self, server};
use crate::core::config::Config;
use crate::docker::DockerRuntime;
use crate::driver::FlannelDriver;
use crate::kv::etcd::EtcdKv;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Plugin socket path.
    #[arg(long, default_value = api::DEFAULT_SOCKET)]
    pub socket: PathBuf,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse and validate the environment configuration, then exit.
    Validate,
}

/// `flannel-np start`
pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let kv = EtcdKv::connect(&config.etcd_endpoints)
        .await
        .context("cannot reach the coordination store")?;
    let runtime = DockerRuntime::connect().context("cannot reach the container runtime")?;

    let driver = FlannelDriver::init(config, kv, runtime)
        .await
        .context("driver initialization failed")?;

    server::serve(driver, &args.socket)
        .await
        .context("plugin server failed")?;
    Ok(())
}

/// `flannel-np config validate`
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Validate => {
            let config = Config::from_env().context("invalid configuration")?;
            println!(
                "configuration ok: {} pool subnets, {} addresses per host subnet",
                config.pool_capacity(),
                config.addresses_per_host()
            );
            Ok(())
        }
    }
}
