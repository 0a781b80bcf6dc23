//! A thin, one-shot config loader: read a TOML file, deserialize it into
//! a `Config`, and validate referential integrity before handing it to a
//! `ProxyManager`. No live reload wiring lives here; that stays a
//! separate concern from the core runtime.

use std::path::Path;

use switchboard_core::{Config, ConfigError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path} as TOML: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("{} referential integrity problem(s) found", .0.len())]
    Invalid(Vec<ConfigError>),
}

/// Read and validate a `Config` from a TOML file at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    config.validate().map_err(ConfigLoadError::Invalid)?;

    Ok(config)
}
