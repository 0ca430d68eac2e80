use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "migd", version, about = "Live migration controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the controller, optionally with a YAML config file
    Start {
        #[arg(short, long, env = "MIGD_CONFIG")]
        config: Option<PathBuf>,
    },
}
