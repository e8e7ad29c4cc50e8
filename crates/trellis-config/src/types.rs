//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Grace period between interrupting a runner and killing it
    #[serde(default = "default_run_timeout", with = "humantime_serde")]
    pub run_timeout: Duration,

    /// How long a runner's declared endpoint may take to open
    #[serde(default = "default_endpoint_timeout", with = "humantime_serde")]
    pub endpoint_timeout: Duration,

    /// Maximum bytes read from an error response body (bytes)
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit: usize,

    /// Number of body frames buffered per in-process invocation
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Log every forwarded request
    #[serde(default)]
    pub verbose: bool,

    /// Active plugins, in load order
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Plugin definitions by name
    #[serde(default)]
    pub plugin: BTreeMap<String, PluginConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            run_timeout: default_run_timeout(),
            endpoint_timeout: default_endpoint_timeout(),
            request_body_limit: default_request_body_limit(),
            stream_buffer: default_stream_buffer(),
            verbose: false,
            plugins: Vec::new(),
            plugin: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Directory a plugin's files live in
    pub fn plugin_dir(&self, plugin: &str) -> PathBuf {
        self.server.root_dir.join("plugins").join(plugin)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Directory for the database and runner sockets
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Installation root; plugins live under `<root_dir>/plugins`
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            root_dir: default_root_dir(),
        }
    }
}

/// One plugin's definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Plugin version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Runners, by name
    #[serde(default)]
    pub run: BTreeMap<String, RunConfig>,

    /// Route pattern to target URI
    ///
    /// Patterns are paths with `:param` and trailing `*` segments, optionally
    /// prefixed with a method (`"POST /api/notes/*"`). Targets are `run://`
    /// references or proxy URLs.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,

    /// Events forwarded to the plugin
    #[serde(default)]
    pub on: BTreeMap<String, EventForward>,

    /// Apps provisioned for every user
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
}

/// Forward an event to a handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventForward {
    /// Target the event is POSTed to
    pub post: String,
}

/// App created on behalf of a plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Display name
    pub name: String,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Events on this app forwarded to the plugin
    #[serde(default)]
    pub on: BTreeMap<String, EventForward>,

    /// Sources created inside the app
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

/// Source created inside a provisioned app
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Display name
    pub name: String,

    /// Source type
    #[serde(rename = "type")]
    pub source_type: String,

    /// Create after the plugin's runners have started
    #[serde(default)]
    pub defer: bool,

    /// Events on this source forwarded to the plugin
    #[serde(default)]
    pub on: BTreeMap<String, EventForward>,
}

/// Runner definition
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Runtime type (`exec` when unset)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub run_type: Option<String>,

    /// Runner is skipped when `false`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Cron expression for periodic runners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Runtime-specific settings (`cmd`, `api`, `key`, ...)
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl RunConfig {
    /// Runtime type, defaulting to `exec`
    pub fn run_type(&self) -> &str {
        self.run_type.as_deref().unwrap_or("exec")
    }

    /// Whether the runner should be started
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1324))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_endpoint_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_body_limit() -> usize {
    1024 * 1024 // 1MB
}

fn default_stream_buffer() -> usize {
    16
}
