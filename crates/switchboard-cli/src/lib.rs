//! The composition root: loads a `Config` from a TOML file, wires up a
//! `ProxyManager` and `switchboard-proxy`'s HTTP server, and runs them
//! until shutdown.

#![deny(unsafe_code)]

pub mod cli;
pub mod config_loader;

pub use cli::{Cli, Command};
pub use config_loader::{load_config, ConfigLoadError};
