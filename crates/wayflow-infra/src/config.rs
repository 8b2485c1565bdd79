//! Engine configuration loader for Wayflow.
//!
//! Reads `wayflow.toml` from the data directory (`~/.wayflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use thiserror::Error;
use wayflow_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "wayflow.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Load engine configuration from `{data_dir}/wayflow.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Write `config` to `{data_dir}/wayflow.toml`, creating the directory.
/// Returns the file path.
pub async fn save_engine_config(
    data_dir: &Path,
    config: &EngineConfig,
) -> Result<PathBuf, ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE);
    let content = toml::to_string_pretty(config)?;

    let io_err = |source| ConfigError::Io {
        path: config_path.clone(),
        source,
    };
    tokio::fs::create_dir_all(data_dir).await.map_err(io_err)?;
    tokio::fs::write(&config_path, content).await.map_err(io_err)?;
    Ok(config_path)
}
