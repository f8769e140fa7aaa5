//! Workspace initialization: writes a starter `config/config.toml`.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::{ProviderConfig, ProviderType, QuizgenConfig};
use crate::error::{GenerationError, StorageError};

/// Result of `initialize_workspace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResult {
    pub config_path: PathBuf,
    /// False when a config already existed and `force` was not set
    pub written: bool,
}

/// Defaults plus one local Ollama provider selected as the default.
pub fn starter_config() -> QuizgenConfig {
    let mut config = QuizgenConfig::default();
    config.providers.insert(
        "local".to_string(),
        ProviderConfig {
            provider_name: None,
            provider_type: ProviderType::Ollama,
            model: "llama3".to_string(),
            api_key: None,
            endpoint: None,
            temperature: Some(0.7),
            max_tokens: None,
        },
    );
    config.default_provider = Some("local".to_string());
    config
}

/// Write the starter config under `workspace_root`. An existing file is kept unless
/// `force` is set.
pub fn initialize_workspace(workspace_root: &Path, force: bool) -> Result<InitResult, GenerationError> {
    let config_path = workspace_root.join("config").join("config.toml");
    if config_path.exists() && !force {
        return Ok(InitResult {
            config_path,
            written: false,
        });
    }

    let content = toml::to_string_pretty(&starter_config()).map_err(|e| {
        GenerationError::ConfigError(format!("Failed to serialize starter config: {}", e))
    })?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(StorageError::IoError)?;
    }
    std::fs::write(&config_path, content).map_err(StorageError::IoError)?;

    info!(config_path = %config_path.display(), "Wrote starter configuration");
    Ok(InitResult {
        config_path,
        written: true,
    })
}
