// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Skiff Manager CLI
//!
//! The `skiff` binary runs the service manager: the HTTP API that deploys,
//! kills and routes services, plus the startup sequence that brings the
//! proxy configuration back in line with the record store.
//!
//! ## Commands
//!
//! - `skiff serve` - Run the manager in the foreground
//! - `skiff config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

mod commands;
mod daemon;

use commands::ConfigCommand;
use daemon::ServeOverrides;

/// Skiff - run services behind a reverse proxy
#[derive(Parser)]
#[command(name = "skiff")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SKIFF_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, env = "SKIFF_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager API in the foreground
    #[command(name = "serve")]
    Serve {
        /// API bind address (default: from config)
        #[arg(long, env = "SKIFF_HOST")]
        host: Option<String>,

        /// API port (default: from config)
        #[arg(long, env = "SKIFF_PORT")]
        port: Option<u16>,

        /// Emit logs as JSON lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            host,
            port,
            json_logs,
        }) => {
            let overrides = ServeOverrides {
                host,
                port,
                log_level: cli.log_level,
            };
            let config = daemon::load_config(cli.config, &overrides)?;
            let level = overrides
                .log_level
                .as_deref()
                .or(config.log_level())
                .unwrap_or("info");
            init_logging(level, json_logs || config.log_format() == "json")?;
            info!("Starting Skiff manager");
            daemon::start_daemon(config).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), false)?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_target(false).compact().init();
    }

    Ok(())
}
