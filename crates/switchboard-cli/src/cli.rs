//! Argument parsing via `clap`'s derive API.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "switchboard", about = "Reverse proxy and backend lifecycle manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load a config file, start persistent groups, and serve.
    Serve {
        /// Path to the TOML config file.
        #[arg(long, env = "SWITCHBOARD_CONFIG")]
        config: PathBuf,

        /// Address to bind the HTTP server to.
        #[arg(long, env = "SWITCHBOARD_BIND", default_value = "127.0.0.1:8080")]
        bind: String,

        /// How long to wait for in-flight requests to drain on shutdown
        /// before forcing every process to stop.
        #[arg(long, default_value = "30")]
        shutdown_timeout_secs: u64,
    },

    /// Parse and validate a config file without starting anything.
    Validate {
        /// Path to the TOML config file.
        #[arg(long, env = "SWITCHBOARD_CONFIG")]
        config: PathBuf,
    },
}
