//! Configuration validation

use crate::types::{Config, PluginConfig, RunConfig};
use std::str::FromStr;
use trellis_core::{Error, Result};
use url::Url;

/// Runtime types the host binary supports
pub const RUN_TYPES: &[&str] = &["exec", "builtin"];

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server(config)?;

    for name in &config.plugins {
        let plugin = config.plugin.get(name).ok_or_else(|| {
            Error::Config(format!("active plugin '{name}' has no configuration"))
        })?;
        validate_plugin(name, plugin)?;
    }

    Ok(())
}

fn validate_server(config: &Config) -> Result<()> {
    if config.run_timeout.is_zero() {
        return Err(Error::Config("run_timeout must be > 0".to_string()));
    }
    if config.endpoint_timeout.is_zero() {
        return Err(Error::Config("endpoint_timeout must be > 0".to_string()));
    }
    if config.stream_buffer == 0 {
        return Err(Error::Config("stream_buffer must be > 0".to_string()));
    }
    if config.request_body_limit == 0 {
        return Err(Error::Config("request_body_limit must be > 0".to_string()));
    }
    Ok(())
}

fn validate_plugin(name: &str, plugin: &PluginConfig) -> Result<()> {
    for (runner, run) in &plugin.run {
        validate_run(name, runner, run)?;
    }

    for (pattern, target) in &plugin.routes {
        validate_route(name, pattern, target)?;
    }

    let forwards = plugin
        .on
        .values()
        .chain(plugin.apps.values().flat_map(|a| a.on.values()))
        .chain(
            plugin
                .apps
                .values()
                .flat_map(|a| a.sources.values())
                .flat_map(|s| s.on.values()),
        );
    for forward in forwards {
        validate_target(name, &forward.post)?;
    }

    Ok(())
}

fn validate_run(plugin: &str, runner: &str, run: &RunConfig) -> Result<()> {
    let run_type = run.run_type();
    if !RUN_TYPES.contains(&run_type) {
        return Err(Error::UnknownRuntype(format!("{plugin}/{runner}: {run_type}")));
    }

    if run_type == "exec" {
        let cmd = run.config.get("cmd").and_then(|v| v.as_array());
        match cmd {
            Some(cmd) if !cmd.is_empty() && cmd.iter().all(|c| c.is_string()) => {}
            _ => {
                return Err(Error::Config(format!(
                    "{plugin}/{runner}: cmd must be a non-empty array of strings"
                )))
            }
        }
    }

    if let Some(expr) = &run.cron {
        parse_cron(expr)
            .map_err(|e| Error::Config(format!("{plugin}/{runner}: invalid cron '{expr}': {e}")))?;
    }

    Ok(())
}

fn validate_route(plugin: &str, pattern: &str, target: &str) -> Result<()> {
    let path = match pattern.split_once(' ') {
        Some((_method, path)) => path.trim(),
        None => pattern,
    };
    if !path.starts_with('/') {
        return Err(Error::Config(format!(
            "{plugin}: route '{pattern}' must start with '/'"
        )));
    }
    validate_target(plugin, target)
}

fn validate_target(plugin: &str, target: &str) -> Result<()> {
    if target.starts_with("run://") || target.starts_with("unix://") {
        return Ok(());
    }
    match Url::parse(target) {
        Ok(url) if url.scheme() == "http" => Ok(()),
        _ => Err(Error::Config(format!(
            "{plugin}: invalid target '{target}'"
        ))),
    }
}

/// Parse a cron expression
///
/// Standard five-field expressions are accepted by prepending a seconds
/// field.
pub fn parse_cron(expr: &str) -> std::result::Result<cron::Schedule, cron::error::Error> {
    if expr.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {expr}"))
    } else {
        cron::Schedule::from_str(expr)
    }
}
