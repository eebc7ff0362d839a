//! Parley configuration system.
//!
//! TOML-based configuration shared by the relay binary and calling
//! clients. Every section uses serde defaults so partial configs work
//! out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use parley_config::{load_config, config_to_json};
//!
//! let config = load_config(None).expect("failed to load config");
//! println!("{}", config_to_json(&config));
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    HistoryConfig, IceConfig, IceServerConfig, LoggingConfig, ParleyConfig, QualityConfig,
    QualityThresholds, RelayConfig,
};

use std::path::Path;

use parley_common::ConfigError;

/// Load config from `path`, or from the platform default path when `None`,
/// and validate it.
///
/// The default path gets a fresh `config.toml` if none exists; an explicit
/// path must exist.
pub fn load_config(path: Option<&Path>) -> Result<ParleyConfig, ConfigError> {
    let config = match path {
        Some(path) => toml_loader::load_from_path(path)?,
        None => toml_loader::load_default()?,
    };
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
pub fn config_to_json(config: &ParleyConfig) -> String {
    serde_json::to_string_pretty(config)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
