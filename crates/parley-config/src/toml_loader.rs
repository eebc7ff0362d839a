//! TOML config loading: read from a path or the platform default.

use crate::schema::ParleyConfig;
use crate::validation;
use parley_common::ConfigError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the platform-specific default config file path.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::ParseError("could not determine config directory".into()))?;
    Ok(config_dir.join("parley").join("config.toml"))
}

/// Load config from a specific TOML file path.
///
/// Missing fields take their serde defaults. Validation failures are
/// logged, not fatal; callers that need strictness run
/// [`validation::validate`] themselves.
pub fn load_from_path(path: &Path) -> Result<ParleyConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("failed to read {}: {e}", path.display())))?;

    let config: ParleyConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;

    if let Err(e) = validation::validate(&config) {
        warn!("config validation warning: {e}");
    }

    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Load config from the platform default path, writing a default file
/// first if none exists.
pub fn load_default() -> Result<ParleyConfig, ConfigError> {
    let path = default_config_path()?;

    match load_from_path(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(_)) => {
            info!("no config found at {}, creating default", path.display());
            create_default_config(&path)?;
            Ok(ParleyConfig::default())
        }
        Err(e) => Err(e),
    }
}

/// Write the default config as TOML to `path`, creating parent directories.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::ParseError(format!(
                "failed to create config directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let content = toml::to_string_pretty(&ParleyConfig::default())
        .map_err(|e| ConfigError::ParseError(format!("failed to serialize default config: {e}")))?;

    std::fs::write(path, content).map_err(|e| {
        ConfigError::ParseError(format!(
            "failed to write default config to {}: {e}",
            path.display()
        ))
    })?;

    info!("created default config at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_nonexistent_returns_file_not_found() {
        let result = load_from_path(Path::new("/tmp/nonexistent_parley_config.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_valid_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[relay]
port = 9443
url = "wss://relay.example.com"

[[ice.servers]]
urls = ["turn:turn.example.com:3478"]
username = "relay-user"
credential = "s3cret"
"#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.relay.port, 9443);
        assert_eq!(config.relay.url, "wss://relay.example.com");
        assert_eq!(config.ice.servers.len(), 1);
        assert!(config.ice.servers[0].is_turn());
        // Defaults preserved
        assert_eq!(config.relay.queue_capacity, 256);
        assert_eq!(config.quality.sample_interval_secs, 5);
    }

    #[test]
    fn load_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        let result = load_from_path(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn default_file_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        create_default_config(&path).unwrap();
        assert!(path.exists());

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.ice, crate::schema::IceConfig::default());
        assert!(validation::validate(&config).is_ok());
    }
}
