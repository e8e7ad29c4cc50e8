//! Configuration loading

use crate::{Config, ConfigFormat};
use regex::{Captures, Regex};
use std::env;
use std::fs;
use std::path::Path;
use trellis_core::{Error, Result};

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;
    tracing::debug!(path = %path.display(), format = ?format, "Loading configuration");

    load_from_str(&content, format)
}

/// Substitute `${VAR}` and `${VAR:-default}` from the environment
///
/// A variable that is unset and has no default is an error naming it.
fn expand_env_vars(content: &str) -> Result<String> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("bad env pattern: {e}")))?;

    let mut missing = Vec::new();
    let expanded = pattern.replace_all(content, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "environment variable(s) {} not set and no default given",
            missing.join(", ")
        )));
    }
    Ok(expanded.into_owned())
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let content = expand_env_vars(content)?;
    let parsed = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::from_str(&content).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| Error::Config(format!("invalid {format:?} configuration: {e}")))
}

/// Load and validate configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}
