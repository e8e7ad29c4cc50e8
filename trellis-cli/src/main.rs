//! Trellis CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use trellis_config::load_config;
use trellis_runtime::{ServerBuilder, SignalHandler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Trellis plugin host", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configured plugins and serve requests
    Serve {
        /// Path to configuration file
        #[arg(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.yaml")]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.yaml")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            log_level,
            log_format,
        } => {
            init_tracing(&log_level, log_format)?;
            tracing::info!(config = %config.display(), "Starting Trellis");

            let config = load_config(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            tracing::info!(
                listen = %config.server.listen,
                data_dir = %config.server.data_dir.display(),
                plugins = ?config.plugins,
                "Configuration loaded"
            );

            let server = ServerBuilder::new().config(config).build()?;

            let shutdown_signal = server.shutdown_signal();
            tokio::spawn(SignalHandler::new(shutdown_signal).run());

            server.run().await?;
            Ok(())
        }

        Commands::Validate { config } => {
            init_tracing("info", LogFormat::Text)?;

            let cfg = load_config(&config)
                .with_context(|| format!("invalid configuration {}", config.display()))?;
            tracing::info!(
                listen = %cfg.server.listen,
                plugins = cfg.plugins.len(),
                defined = cfg.plugin.len(),
                "Configuration is valid"
            );
            Ok(())
        }

        Commands::Version => {
            println!("Trellis");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("bad log level '{level}'"))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from([
            "trellis",
            "serve",
            "--config",
            "site.toml",
            "--log-format",
            "json",
        ]);
        match cli.command {
            Commands::Serve {
                config,
                log_level,
                log_format,
            } => {
                assert_eq!(config, PathBuf::from("site.toml"));
                assert_eq!(log_level, "info");
                assert_eq!(log_format, LogFormat::Json);
            }
            _ => panic!("expected serve"),
        }
    }
}
