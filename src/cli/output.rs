//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::GenerationError;

/// Map domain/service errors to a string for CLI output.
pub fn map_error(e: &GenerationError) -> String {
    match e {
        GenerationError::ProviderNotConfigured(_) => format!(
            "{}\nAdd a [providers.<name>] section to config/config.toml or pass --config.",
            e
        ),
        GenerationError::ProviderAuthFailed(_) => {
            format!("{}\nCheck the provider api_key or OPENAI_API_KEY.", e)
        }
        _ => e.to_string(),
    }
}
