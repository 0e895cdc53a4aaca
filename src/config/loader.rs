//! Configuration loading from disk

use super::schema::ServerConfig;
use super::validation::{validate_config, ValidationError};
use std::fs;
use std::path::Path;

/// Why a configuration file was refused
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate a TOML configuration file
pub fn load_config(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path.as_ref())?;
    let config: ServerConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    tracing::debug!(path = %path.as_ref().display(), "configuration loaded");
    Ok(config)
}
