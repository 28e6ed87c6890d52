// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use skiff_manager_core::domain::manager_config::{ManagerConfigManifest, StorageBackend};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default filled in
    Generate {
        /// Output path (default: ./skiff-config.yaml)
        #[arg(short, long, default_value = "./skiff-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ManagerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SKIFF_CONFIG_PATH: {}",
            std::env::var("SKIFF_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./skiff-config.yaml");
        println!("  4. ~/.skiff/config.yaml");
        println!("  5. /etc/skiff/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Manager:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Internal URL: {}", spec.manager.internal_url);
    println!("  In container: {}", spec.manager.in_container);
    println!("  Data dir: {}", spec.manager.data_dir.display());
    println!(
        "  Email: {}",
        spec.manager.email.as_deref().unwrap_or("(none)")
    );
    println!("  API: {}:{}", spec.network.bind_address, spec.network.port);
    println!();

    println!("{}", "Proxy:".bold());
    println!("  Domain: {}", spec.proxy.domain);
    println!("  Ports: http {} / https {}", spec.proxy.http_port, spec.proxy.https_port);
    println!("  HTTPS: {}", spec.proxy.https);
    if spec.proxy.https && spec.proxy.staging_ca {
        println!("  {}", "Using the staging certificate authority".yellow());
    }
    println!("  Auth: {}", spec.proxy.auth_enabled);
    println!("  Dynamic config: {}", config.dynamic_config_dir().display());
    println!();

    println!("{}", "Runtime:".bold());
    println!(
        "  Docker socket: {}",
        spec.runtime.docker_socket_path.as_deref().unwrap_or("(default)")
    );
    println!("  Container prefix: {}", spec.runtime.container_prefix);
    println!("  Network: {}", spec.runtime.network);
    println!(
        "  External ports: {}..{}",
        spec.runtime.first_external_port,
        u32::from(spec.runtime.first_external_port) + u32::from(spec.runtime.max_port_attempts)
    );
    println!("  Builder image: {}", spec.runtime.builder_image);
    println!();

    println!("{}", "Record store:".bold());
    match spec.database.backend {
        StorageBackend::Sqlite => println!("  SQLite: {}", config.database_url()),
        StorageBackend::Memory => {
            println!("  {}", "In-memory (records are lost on restart)".yellow())
        }
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ManagerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    ManagerConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Generated configuration: {}", output.display()).green()
    );
    println!();
    println!("Next steps:");
    println!("  1. Edit {} to set your domain and ports", output.display());
    println!("  2. Validate: skiff config validate {}", output.display());
    println!("  3. Start the manager: skiff --config {} serve", output.display());

    Ok(())
}
