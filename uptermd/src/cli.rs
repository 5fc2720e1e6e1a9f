use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uptermd_common::config::LogFormat;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[clap(long, short, default_value = "config.yaml", env = "UPTERMD_CONFIG")]
    pub config: PathBuf,

    /// Repeat for more verbose logging.
    #[clap(long, short, action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Overrides the configured log format.
    #[clap(long)]
    pub log_format: Option<LogFormat>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the SSH routing frontend, the internal SSHD, and the WebSocket adapter.
    Run,
    /// Generate the server's long-lived host key pair, if it doesn't already exist.
    GenerateHostKeys,
}
