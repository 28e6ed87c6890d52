// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Manager Configuration Types
//
// Defines the configuration schema for a Skiff manager, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Reverse proxy settings (domain, ports, HTTPS, auth)
// - Container runtime settings (network, naming, port allocation)
// - Record store backend
// - HTTP API and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::routing::{RoutingPolicy, StaticProxySettings};

pub const API_VERSION: &str = "skiff.dev/v1";
pub const KIND: &str = "ManagerConfig";

/// Top-level Kubernetes-style manager configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfigManifest {
    /// API version (must be "skiff.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ManagerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ManagerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfigSpec {
    #[serde(default)]
    pub manager: ManagerSettings,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// URL at which the proxy reaches the manager's own API
    #[serde(default = "default_internal_url")]
    pub internal_url: String,

    /// Whether the manager itself runs inside a container on the same host
    #[serde(default)]
    pub in_container: bool,

    /// Directory for manager state (database, ACME storage)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Operator contact address, used for ACME registration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            internal_url: default_internal_url(),
            in_container: false,
            data_dir: default_data_dir(),
            email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Host name the proxy answers for
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_proxy_http_port")]
    pub http_port: u16,

    #[serde(default = "default_proxy_https_port")]
    pub https_port: u16,

    /// Directory holding traefik.toml; dynamic files go to `<config_path>/dynamic`
    #[serde(default = "default_proxy_config_path")]
    pub config_path: PathBuf,

    #[serde(default)]
    pub https: bool,

    /// Use the Let's Encrypt staging CA (for testing HTTPS setups)
    #[serde(default)]
    pub staging_ca: bool,

    /// Put the forward-auth middleware in front of every service route
    #[serde(default)]
    pub auth_enabled: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            http_port: default_proxy_http_port(),
            https_port: default_proxy_https_port(),
            config_path: default_proxy_config_path(),
            https: false,
            staging_ca: false,
            auth_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path to Docker socket. Auto-detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,

    /// Prefix of every service container name
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Docker network all service containers join
    #[serde(default = "default_network_name")]
    pub network: String,

    /// First host port tried when publishing a service port
    #[serde(default = "default_first_external_port")]
    pub first_external_port: u16,

    /// Upper bound on consecutive "port is already allocated" retries
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,

    /// Delay before a new container's restart policy is set to "always"
    #[serde(default = "default_restart_policy_grace")]
    pub restart_policy_grace_seconds: u64,

    /// Address of the Docker host as seen from service containers
    #[serde(default = "default_host_gateway")]
    pub host_gateway: String,

    /// s2i builder image used for source and git deploys
    #[serde(default = "default_builder_image")]
    pub builder_image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket_path: None,
            container_prefix: default_container_prefix(),
            network: default_network_name(),
            first_external_port: default_first_external_port(),
            max_port_attempts: default_max_port_attempts(),
            restart_policy_grace_seconds: default_restart_policy_grace(),
            host_gateway: default_host_gateway(),
            builder_image: default_builder_image(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// SQLite connection string. Defaults to `<data_dir>/skiff.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus listener port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_internal_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".skiff"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_proxy_http_port() -> u16 {
    5080
}

fn default_proxy_https_port() -> u16 {
    5443
}

fn default_proxy_config_path() -> PathBuf {
    PathBuf::from("proxy_config")
}

fn default_container_prefix() -> String {
    crate::domain::service::DEFAULT_CONTAINER_PREFIX.to_string()
}

fn default_network_name() -> String {
    "skiff-network".to_string()
}

fn default_first_external_port() -> u16 {
    8001
}

fn default_max_port_attempts() -> u16 {
    100
}

fn default_restart_policy_grace() -> u64 {
    5
}

fn default_host_gateway() -> String {
    "172.17.0.1".to_string()
}

fn default_builder_image() -> String {
    "skiff/s2i-python:latest".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ManagerConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "skiff-manager".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: ManagerConfigSpec::default(),
        }
    }
}

impl ManagerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SKIFF_CONFIG_PATH environment variable
    /// 2. ./skiff-config.yaml (working directory)
    /// 3. ~/.skiff/config.yaml (user home)
    /// 4. /etc/skiff/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SKIFF_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./skiff-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".skiff").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/skiff/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let spec = &mut self.spec;

        if let Some(val) = lookup("SKIFF_HOST_NAME") {
            tracing::info!("Environment override: SKIFF_HOST_NAME={}", val);
            spec.proxy.domain = val;
        }
        if let Some(port) = parse_port(&lookup, "SKIFF_PROXY_HTTP_PORT") {
            spec.proxy.http_port = port;
        }
        if let Some(port) = parse_port(&lookup, "SKIFF_PROXY_HTTPS_PORT") {
            spec.proxy.https_port = port;
        }
        if let Some(val) = lookup("SKIFF_PROXY_CONFIG_PATH") {
            tracing::info!("Environment override: SKIFF_PROXY_CONFIG_PATH={}", val);
            spec.proxy.config_path = PathBuf::from(val);
        }
        if let Some(flag) = parse_flag(&lookup, "SKIFF_PROXY_HTTPS") {
            spec.proxy.https = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "SKIFF_HTTPS_STAGING_SERVER") {
            spec.proxy.staging_ca = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "SKIFF_AUTH_ENABLED") {
            spec.proxy.auth_enabled = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "SKIFF_MANAGER_IN_CONTAINER") {
            spec.manager.in_container = flag;
        }
        if let Some(val) = lookup("SKIFF_CONFIG_EMAIL") {
            spec.manager.email = Some(val);
        }
        if let Some(val) = lookup("SKIFF_DATABASE_URL") {
            spec.database.backend = StorageBackend::Sqlite;
            spec.database.url = Some(val);
        }
        if let Some(val) = lookup("SKIFF_LOG_LEVEL") {
            let observability = spec.observability.get_or_insert(ObservabilityConfig {
                logging: None,
                metrics: None,
            });
            let logging = observability.logging.get_or_insert(LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
            });
            logging.level = val.to_lowercase();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let proxy = &self.spec.proxy;
        if proxy.domain.is_empty() {
            anyhow::bail!("spec.proxy.domain cannot be empty");
        }
        if proxy.http_port == 0 || proxy.https_port == 0 {
            anyhow::bail!("spec.proxy ports must be non-zero");
        }
        if proxy.http_port == proxy.https_port {
            anyhow::bail!(
                "spec.proxy.http_port and spec.proxy.https_port must differ (both {})",
                proxy.http_port
            );
        }

        let runtime = &self.spec.runtime;
        if runtime.container_prefix.is_empty()
            || runtime.container_prefix.contains('-')
            || runtime.container_prefix.contains('/')
        {
            anyhow::bail!(
                "spec.runtime.container_prefix '{}' must be non-empty and contain no '-' or '/'",
                runtime.container_prefix
            );
        }
        if runtime.network.is_empty() {
            anyhow::bail!("spec.runtime.network cannot be empty");
        }
        if runtime.first_external_port == 0 {
            anyhow::bail!("spec.runtime.first_external_port must be non-zero");
        }
        if runtime.max_port_attempts == 0 {
            anyhow::bail!("spec.runtime.max_port_attempts must be at least 1");
        }
        if u32::from(runtime.first_external_port) + u32::from(runtime.max_port_attempts) > 65536 {
            anyhow::bail!(
                "spec.runtime port range {}+{} exceeds 65535",
                runtime.first_external_port,
                runtime.max_port_attempts
            );
        }

        if let Some(logging) = self.spec.observability.as_ref().and_then(|o| o.logging.as_ref()) {
            if !matches!(logging.format.as_str(), "json" | "text") {
                anyhow::bail!("Invalid log format '{}'. Expected 'json' or 'text'", logging.format);
            }
        }

        Ok(())
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy {
            domain: self.spec.proxy.domain.clone(),
            tls: self.spec.proxy.https,
            auth_enabled: self.spec.proxy.auth_enabled,
        }
    }

    pub fn dynamic_config_dir(&self) -> PathBuf {
        self.spec.proxy.config_path.join("dynamic")
    }

    pub fn static_proxy_settings(&self) -> StaticProxySettings {
        StaticProxySettings {
            http_port: self.spec.proxy.http_port,
            https_port: self.spec.proxy.https_port,
            dynamic_dir: self.dynamic_config_dir(),
            https: self.spec.proxy.https,
            email: self.spec.manager.email.clone(),
            acme_storage: self.spec.manager.data_dir.join("acme.json"),
            staging_ca: self.spec.proxy.staging_ca,
        }
    }

    pub fn database_url(&self) -> String {
        self.spec.database.url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                self.spec.manager.data_dir.join("skiff.db").display()
            )
        })
    }

    pub fn log_level(&self) -> Option<&str> {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.as_ref())
            .map(|l| l.level.as_str())
    }

    pub fn log_format(&self) -> &str {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.as_ref())
            .map(|l| l.format.as_str())
            .unwrap_or("text")
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let val = lookup(key)?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => {
            tracing::info!("Environment override: {}=true", key);
            Some(true)
        }
        "false" | "0" | "no" | "off" => {
            tracing::info!("Environment override: {}=false", key);
            Some(false)
        }
        _ => {
            tracing::warn!(
                "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                key,
                val
            );
            None
        }
    }
}

fn parse_port(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u16> {
    let val = lookup(key)?;
    match val.parse::<u16>() {
        Ok(port) => {
            tracing::info!("Environment override: {}={}", key, port);
            Some(port)
        }
        Err(_) => {
            tracing::warn!("Invalid port for {}: '{}'. Ignoring.", key, val);
            None
        }
    }
}
