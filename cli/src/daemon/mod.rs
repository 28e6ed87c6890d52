// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Manager process
//!
//! Handles:
//! - Configuration loading and command line overrides
//! - Wiring the record store, runtime, proxy and lifecycle service together
//! - The startup sequence and the HTTP API
//! - Graceful shutdown

use anyhow::{Context, Result};
use std::path::PathBuf;

use skiff_manager_core::domain::manager_config::ManagerConfigManifest;

pub mod server;

pub use server::start_daemon;

/// Command line values that win over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
}

/// Loads the manifest (explicit path, discovery, or defaults), applies
/// environment and command line overrides, then validates it.
pub fn load_config(
    config_path: Option<PathBuf>,
    overrides: &ServeOverrides,
) -> Result<ManagerConfigManifest> {
    let mut config =
        ManagerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    apply_overrides(&mut config, overrides);

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

fn apply_overrides(config: &mut ManagerConfigManifest, overrides: &ServeOverrides) {
    if let Some(host) = &overrides.host {
        config.spec.network.bind_address = host.clone();
    }
    if let Some(port) = overrides.port {
        config.spec.network.port = port;
    }
}
