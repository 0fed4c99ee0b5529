//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// flannel-np - VXLAN overlay network driver plugin.
#[derive(Parser, Debug)]
#[command(name = "flannel-np")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the driver and serve the plugin socket.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
