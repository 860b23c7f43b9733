//! Engine configuration loading from TOML files.

use super::EngineConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

impl EngineConfig {
    /// Load a TOML file. String values may reference `${ENV_VAR}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse engine config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(&expand_env(content))?)
    }
}

/// Configuration for this process: the file named by `ENGINE_CONFIG` if
/// set, otherwise the `ENGINE_PROFILE` profile.
pub fn load_engine_config() -> Result<EngineConfig> {
    match std::env::var("ENGINE_CONFIG") {
        Ok(path) if !path.is_empty() => {
            info!(path = %path, "Loading engine config file");
            EngineConfig::from_file(path)
        }
        _ => Ok(EngineConfig::from_env()),
    }
}

/// Expand ${VAR_NAME} patterns with environment variable values.
/// Unset variables are left as written.
pub(crate) fn expand_env(s: &str) -> String {
    expand_with(s, |name| std::env::var(name).ok())
}

fn expand_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut result = s.to_string();

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Some(value) = lookup(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    result
}
