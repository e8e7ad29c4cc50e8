//! Configuration builder

use crate::types::{Config, PluginConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.config.server.listen = addr;
        self
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.server.data_dir = dir.into();
        self
    }

    /// Set the installation root
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.server.root_dir = dir.into();
        self
    }

    /// Set the runner stop grace period
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    /// Set the endpoint readiness deadline
    pub fn endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.config.endpoint_timeout = timeout;
        self
    }

    /// Enable verbose forwarding logs
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Define a plugin and append it to the active list
    pub fn plugin(mut self, name: impl Into<String>, plugin: PluginConfig) -> Self {
        let name = name.into();
        if !self.config.plugins.contains(&name) {
            self.config.plugins.push(name.clone());
        }
        self.config.plugin.insert(name, plugin);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> trellis_core::Result<Config> {
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_activates_plugins_in_order() {
        let config = ConfigBuilder::new()
            .data_dir("/tmp/data")
            .plugin("b", PluginConfig::default())
            .plugin("a", PluginConfig::default())
            .plugin("b", PluginConfig::default())
            .build()
            .unwrap();

        assert_eq!(config.plugins, vec!["b", "a"]);
        assert_eq!(config.server.data_dir, PathBuf::from("/tmp/data"));
    }
}
