use clap::Parser;
use std::path::PathBuf;

/// bladed — supervision daemon for compute-blade carrier boards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: /etc/bladed/config.yaml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Fork into the background
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "debug", default_value = "false")]
    pub debug: bool,
}
