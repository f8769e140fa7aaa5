//! Config loader: assembles sources in precedence order and deserializes the result.

use config::{Environment, File};
use std::path::{Path, PathBuf};

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::QuizgenConfig;

/// Entry point for loading `QuizgenConfig`.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load layered configuration for `workspace_root`.
    ///
    /// Precedence, lowest first: defaults, global file, `config/config.toml`,
    /// `config/{QUIZGEN_ENV}.toml`, `QUIZGEN__SECTION__KEY` environment variables.
    pub fn load(workspace_root: &Path) -> Result<QuizgenConfig, config::ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        builder
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Load from one explicit file on top of the defaults. Environment overrides still apply.
    pub fn load_from_file(path: &Path) -> Result<QuizgenConfig, config::ConfigError> {
        merge_policy::builder_with_defaults()?
            .add_source(File::from(path).required(true))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// Location of the global config file, if one can be determined.
    pub fn global_config_path() -> Option<PathBuf> {
        global_file::global_config_path()
    }

    /// Built-in defaults only.
    pub fn default() -> QuizgenConfig {
        QuizgenConfig::default()
    }
}

fn environment() -> Environment {
    Environment::with_prefix("QUIZGEN")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
