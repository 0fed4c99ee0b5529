//! flannel-np - unified CLI entrypoint.
//!
//! Usage:
//!   flannel-np start [--socket PATH]
//!   flannel-np config validate

use anyhow::Result;
use clap::Parser;
use flannel_np::cli::commands::{run_config, run_start};
use flannel_np::cli::{Cli, Commands};
use flannel_np::core::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.log_level, cli.log_json);

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Config(args) => run_config(args),
    }
}
