//! Canopy CLI Binary
//!
//! Command-line interface for the canopy exploration scheduler.

use anyhow::Context;
use canopy::cli::{Cli, Commands, RunContext};
use canopy::config::ConfigLoader;
use canopy::logging::{init_logging, LoggingConfig};
use clap::Parser;
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("Canopy CLI starting");

    match run(cli).await {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .context("Failed to initialize canopy")?;
    let output = context.execute(&cli.command).await?;
    Ok(output)
}

/// Build logging configuration from CLI args, environment, and config file
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    // `run` is a long-lived process; everything else is quiet unless asked
    let is_run = matches!(cli.command, Commands::Run { .. });
    if !cli.verbose && !is_run && cli.log_level.is_none() {
        return LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        };
    }

    let mut config = match cli.config {
        Some(ref path) => ConfigLoader::load_from_file(path)
            .map(|c| c.logging)
            .unwrap_or_default(),
        None => ConfigLoader::load(&cli.workspace)
            .map(|c| c.logging)
            .unwrap_or_default(),
    };

    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    config
}
