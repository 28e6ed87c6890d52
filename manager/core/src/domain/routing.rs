// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reverse-proxy routing model
//!
//! Typed model of the proxy's file-provider configuration (Traefik v2 layout)
//! and the [`RoutingPolicy`] that derives every document the manager writes.
//!
//! Two dynamic documents exist per service:
//!
//! - the **instance route** `{name}_{version}`: serves `/services/{name}_{version}`
//!   from exactly one instance;
//! - the **family route** `{name}`: serves `/services/{name}` from the family's
//!   main and mirrors every request to each shadow.
//!
//! All maps are `BTreeMap` and shadows arrive sorted, so rendering the same
//! store state always yields byte-identical files.
//!
//! Objects the manager itself owns (dashboard, manager UI, auth middleware)
//! are named with a `skiff-` prefix. Service names cannot contain `-`, so
//! these never collide with a service's routers, middlewares or files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::service::{ServiceFamily, ServiceKey, ServiceName};

pub const CERT_RESOLVER: &str = "cert-resolver";
pub const AUTH_MIDDLEWARE: &str = "skiff-auth";
pub const LETSENCRYPT_STAGING_CA: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DASHBOARD_ROUTER: &str = "skiff-dashboard";
const DASHBOARD_STRIPPER: &str = "skiff-dashboard-stripper";
const MANAGER_ROUTER: &str = "skiff-manager";
const LOGIN_ROUTER: &str = "skiff-login";
const MANAGER_SERVICE: &str = "skiff-manager";

// ============================================================================
// Dynamic configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfiguration {
    pub http: HttpConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Middleware>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub rule: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTls {
    pub certresolver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    StripPrefix(StripPrefix),
    ForwardAuth(ForwardAuth),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripPrefix {
    pub prefixes: Vec<String>,
    pub force_slash: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardAuth {
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceDefinition {
    LoadBalancer(LoadBalancer),
    Mirroring(Mirroring),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirroring {
    pub service: String,
    pub mirrors: Vec<Mirror>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    pub name: String,
    pub percent: u8,
}

// ============================================================================
// Static configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfiguration {
    pub entry_points: BTreeMap<String, EntryPoint>,
    pub providers: Providers,
    pub api: ApiSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates_resolvers: Option<BTreeMap<String, CertificateResolver>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<EntryPointHttp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointHttp {
    pub redirections: Redirections,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirections {
    pub entry_point: RedirectTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub to: String,
    pub scheme: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Providers {
    pub providers_throttle_duration: String,
    pub file: FileProvider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProvider {
    pub directory: String,
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub dashboard: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateResolver {
    pub acme: Acme,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acme {
    pub email: String,
    pub storage: String,
    pub http_challenge: HttpChallenge,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpChallenge {
    pub entry_point: String,
}

/// Inputs for the proxy's static configuration file.
#[derive(Debug, Clone)]
pub struct StaticProxySettings {
    pub http_port: u16,
    pub https_port: u16,
    pub dynamic_dir: PathBuf,
    pub https: bool,
    pub email: Option<String>,
    pub acme_storage: PathBuf,
    pub staging_ca: bool,
}

impl StaticConfiguration {
    pub fn build(settings: &StaticProxySettings) -> Self {
        let mut web = EntryPoint {
            address: format!(":{}", settings.http_port),
            http: None,
        };
        let websecure = EntryPoint {
            address: format!(":{}", settings.https_port),
            http: None,
        };

        let mut certificates_resolvers = None;
        if settings.https {
            web.http = Some(EntryPointHttp {
                redirections: Redirections {
                    entry_point: RedirectTarget {
                        to: "websecure".to_string(),
                        scheme: "https".to_string(),
                    },
                },
            });
            let acme = Acme {
                email: settings
                    .email
                    .clone()
                    .unwrap_or_else(|| "dummy@email.com".to_string()),
                storage: settings.acme_storage.display().to_string(),
                http_challenge: HttpChallenge {
                    entry_point: "web".to_string(),
                },
                ca_server: settings
                    .staging_ca
                    .then(|| LETSENCRYPT_STAGING_CA.to_string()),
            };
            certificates_resolvers = Some(BTreeMap::from([(
                CERT_RESOLVER.to_string(),
                CertificateResolver { acme },
            )]));
        }

        Self {
            entry_points: BTreeMap::from([
                ("web".to_string(), web),
                ("websecure".to_string(), websecure),
            ]),
            providers: Providers {
                providers_throttle_duration: "0.5s".to_string(),
                file: FileProvider {
                    directory: settings.dynamic_dir.display().to_string(),
                    watch: true,
                },
            },
            api: ApiSettings { dashboard: true },
            certificates_resolvers,
        }
    }
}

// ============================================================================
// Route identity
// ============================================================================

/// Identifier of one dynamic configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(String);

impl RouteId {
    pub fn instance(key: &ServiceKey) -> Self {
        Self(format!("{}_{}", key.name, key.version))
    }

    pub fn family(name: &ServiceName) -> Self {
        Self(name.to_string())
    }

    pub fn dashboard() -> Self {
        Self(DASHBOARD_ROUTER.to_string())
    }

    pub fn manager() -> Self {
        Self(MANAGER_ROUTER.to_string())
    }

    pub fn auth_middleware() -> Self {
        Self(AUTH_MIDDLEWARE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self) -> String {
        format!("{}_configuration.toml", self.0)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Routing policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    /// Host the proxy answers for
    pub domain: String,
    pub tls: bool,
    pub auth_enabled: bool,
}

impl RoutingPolicy {
    /// Route to a single instance at `/services/{name}_{version}`.
    pub fn instance_route(&self, key: &ServiceKey, url: &str) -> DynamicConfiguration {
        let id = RouteId::instance(key);
        let mut config = self.prefixed_route(&id);
        config.http.services.insert(
            id.to_string(),
            ServiceDefinition::LoadBalancer(LoadBalancer {
                servers: vec![Server { url: url.to_string() }],
            }),
        );
        config
    }

    /// Mirroring route at `/services/{name}`. `None` when the family has no main.
    pub fn family_route(&self, family: &ServiceFamily) -> Option<DynamicConfiguration> {
        let main = family.main.as_ref()?;
        let id = RouteId::family(&family.name);
        let mut config = self.prefixed_route(&id);

        let mirrors = family
            .shadows
            .iter()
            .map(|version| Mirror {
                name: format!("{}_{}", family.name, version),
                percent: 100,
            })
            .collect();
        config.http.services.insert(
            id.to_string(),
            ServiceDefinition::Mirroring(Mirroring {
                service: format!("{}_{}", family.name, main),
                mirrors,
            }),
        );
        Some(config)
    }

    /// Proxy's own dashboard under `/proxy/dashboard` and `/api`.
    pub fn dashboard_route(&self) -> DynamicConfiguration {
        let rule = format!(
            "Host(`{}`) && (PathPrefix(`/proxy/dashboard`) || PathPrefix(`/api`))",
            self.domain
        );
        let mut config = DynamicConfiguration::default();
        config.http.routers.insert(
            DASHBOARD_ROUTER.to_string(),
            self.router(rule, "api@internal", vec![DASHBOARD_STRIPPER.to_string()], true),
        );
        config.http.middlewares.insert(
            DASHBOARD_STRIPPER.to_string(),
            Middleware::StripPrefix(StripPrefix {
                prefixes: vec!["/proxy".to_string()],
                force_slash: false,
            }),
        );
        config
    }

    /// Manager UI at the domain root plus an unauthenticated login page.
    pub fn manager_routes(&self, manager_url: &str) -> DynamicConfiguration {
        let mut config = DynamicConfiguration::default();
        config.http.routers.insert(
            MANAGER_ROUTER.to_string(),
            self.router(format!("Host(`{}`)", self.domain), MANAGER_SERVICE, Vec::new(), true),
        );
        config.http.routers.insert(
            LOGIN_ROUTER.to_string(),
            self.router(
                format!("Host(`{}`) && PathPrefix(`/auth/login`)", self.domain),
                MANAGER_SERVICE,
                Vec::new(),
                false,
            ),
        );
        config.http.services.insert(
            MANAGER_SERVICE.to_string(),
            ServiceDefinition::LoadBalancer(LoadBalancer {
                servers: vec![Server { url: manager_url.to_string() }],
            }),
        );
        config
    }

    /// Forward-auth middleware that asks the manager to verify every request.
    pub fn auth_middleware(&self, manager_url: &str) -> DynamicConfiguration {
        let mut config = DynamicConfiguration::default();
        config.http.middlewares.insert(
            AUTH_MIDDLEWARE.to_string(),
            Middleware::ForwardAuth(ForwardAuth {
                address: format!("{}/auth/verify", manager_url.trim_end_matches('/')),
            }),
        );
        config
    }

    fn prefixed_route(&self, id: &RouteId) -> DynamicConfiguration {
        let path_prefix = format!("/services/{}", id);
        let stripper = format!("{}_prefix_stripper", id);
        let rule = format!("Host(`{}`) && PathPrefix(`{}`)", self.domain, path_prefix);

        let mut config = DynamicConfiguration::default();
        config.http.routers.insert(
            id.to_string(),
            self.router(rule, id.as_str(), vec![stripper.clone()], true),
        );
        config.http.middlewares.insert(
            stripper,
            Middleware::StripPrefix(StripPrefix {
                prefixes: vec![path_prefix],
                force_slash: false,
            }),
        );
        config
    }

    fn router(
        &self,
        rule: String,
        service: &str,
        mut middlewares: Vec<String>,
        authenticated: bool,
    ) -> Router {
        if authenticated && self.auth_enabled {
            middlewares.push(AUTH_MIDDLEWARE.to_string());
        }
        Router {
            rule,
            service: service.to_string(),
            middlewares,
            tls: self.tls.then(|| RouterTls {
                certresolver: CERT_RESOLVER.to_string(),
            }),
        }
    }
}

// ============================================================================
// Route store
// ============================================================================

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to write proxy configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to render proxy configuration: {0}")]
    Serialization(String),
}

impl From<toml::ser::Error> for ProxyError {
    fn from(err: toml::ser::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}

/// Destination for rendered proxy configuration.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Idempotent overwrite of one dynamic document.
    async fn write_route(&self, id: &RouteId, config: &DynamicConfiguration) -> Result<(), ProxyError>;

    /// Idempotent removal of one dynamic document.
    async fn remove_route(&self, id: &RouteId) -> Result<(), ProxyError>;

    async fn write_static(&self, config: &StaticConfiguration) -> Result<(), ProxyError>;
}
