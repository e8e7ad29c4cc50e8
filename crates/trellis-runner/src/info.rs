//! Runner identity

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trellis_config::RunConfig;

const API_KEY_BYTES: usize = 64;

/// Identity of one started runner
///
/// Serialized as a single JSON line to the stdin of `exec` runners.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerInfo {
    /// Owning plugin
    pub plugin: String,

    /// Runner name within the plugin
    pub name: String,

    /// Capability token addressing this runner
    #[serde(rename = "apikey")]
    pub api_key: String,

    /// Declared run configuration
    pub run: RunConfig,

    /// Installation root
    pub root_dir: PathBuf,

    /// Data directory
    pub data_dir: PathBuf,

    /// The plugin's own directory
    pub plugin_dir: PathBuf,

    /// Global configuration
    pub config: serde_json::Value,
}

impl RunnerInfo {
    /// `plugin/name`, for logs and errors
    pub fn id(&self) -> String {
        format!("{}/{}", self.plugin, self.name)
    }

    /// A string setting from the run configuration
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.run.config.get(key).and_then(|v| v.as_str())
    }
}

/// Generate a fresh api key from 64 random bytes
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_api_keys_are_unique() {
        let keys: HashSet<String> = (0..1000).map(|_| generate_api_key()).collect();
        assert_eq!(keys.len(), 1000);
        assert!(keys.iter().all(|k| k.len() == 88));
    }

    #[test]
    fn test_stdin_contract() {
        let info = RunnerInfo {
            plugin: "notes".into(),
            name: "server".into(),
            api_key: "k".into(),
            run: RunConfig::default(),
            root_dir: "/srv".into(),
            data_dir: "/srv/data".into(),
            plugin_dir: "/srv/plugins/notes".into(),
            config: serde_json::json!({"verbose": false}),
        };

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["apikey"], "k");
        assert_eq!(value["plugin_dir"], "/srv/plugins/notes");
        assert_eq!(value["config"]["verbose"], false);
        assert!(value.get("api_key").is_none());
        assert_eq!(info.id(), "notes/server");
    }
}
