// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service Lifecycle Application Service
//!
//! Coordinates every operation that changes the set of deployed services:
//! - Runtime connector: containers and images
//! - Record store: the durable list of instances and the main flag
//! - Proxy configurator: route files derived from the records
//! - Credential issuer, image builder, notifier and event bus
//!
//! The ordering is always runtime, then store, then routes, so route files
//! describe the store after the mutation. Nothing here is cached; every
//! operation re-reads the store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::routing::{ProxyConfigurator, ReplaySummary};
use crate::domain::build::{BuildError, ImageBuilder};
use crate::domain::credentials::{CredentialError, CredentialIssuer};
use crate::domain::events::ServiceEvent;
use crate::domain::notification::{Notification, Notifier, Severity};
use crate::domain::repository::{NewServiceRecord, RepositoryError, ServiceRepository, SyncReport};
use crate::domain::routing::ProxyError;
use crate::domain::runtime::{
    CreateInstanceSpec, LogOptions, LogStream, RunOptions, RuntimeError, RuntimeState,
    ServiceRuntime,
};
use crate::domain::service::{ContainerNaming, ServiceInstance, ServiceKey, ValidationError};
use crate::infrastructure::event_bus::EventBus;

/// Environment variable carrying the service's own API credential
pub const ENV_SERVICE_AUTH_TOKEN: &str = "SKIFF_SERVICE_AUTH_TOKEN";

// ============================================================================
// Requests and errors
// ============================================================================

/// Where the image of a new instance comes from.
#[derive(Debug, Clone)]
pub enum SourceDescriptor {
    /// Existing image, started as is
    Image { image: String, run_options: RunOptions },
    /// Git repository built with s2i
    Git { url: String },
    /// Source directory on the manager host built with s2i
    Source { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub key: ServiceKey,
    /// Port the service listens on inside its container
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub source: SourceDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStage {
    Requested,
    Validated,
    Building,
    RuntimeStarting,
    RuntimeStarted,
    Recorded,
    RoutesWritten,
    Done,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Requested => "requested",
            DeployStage::Validated => "validated",
            DeployStage::Building => "building",
            DeployStage::RuntimeStarting => "runtime_starting",
            DeployStage::RuntimeStarted => "runtime_started",
            DeployStage::Recorded => "recorded",
            DeployStage::RoutesWritten => "routes_written",
            DeployStage::Done => "done",
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("Record store out of sync with runtime: {0}")]
    OutOfSync(SyncReport),
    #[error("Container runtime error: {0}")]
    Substrate(String),
    #[error("Image build failed: {0}")]
    Build(String),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RepositoryError> for LifecycleError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => LifecycleError::NotFound(format!("No such {}", what)),
            RepositoryError::Conflict(msg) => LifecycleError::Conflict(msg),
            RepositoryError::OutOfSync(report) => LifecycleError::OutOfSync(report),
            other => LifecycleError::Internal(other.to_string()),
        }
    }
}

impl From<RuntimeError> for LifecycleError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::NotFound(what) => LifecycleError::NotFound(format!("No such service: {}", what)),
            RuntimeError::ImageNotFound(image) => LifecycleError::NotFound(format!("No such image: {}", image)),
            RuntimeError::Conflict(msg) => LifecycleError::Conflict(msg),
            other => LifecycleError::Substrate(other.to_string()),
        }
    }
}

impl From<BuildError> for LifecycleError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Failed(detail) => LifecycleError::Build(detail),
            BuildError::InvalidArchive(msg) => LifecycleError::Validation(msg),
            BuildError::Unavailable(msg) => LifecycleError::Substrate(msg),
            BuildError::Io(e) => LifecycleError::Internal(e.to_string()),
        }
    }
}

impl From<ProxyError> for LifecycleError {
    fn from(err: ProxyError) -> Self {
        LifecycleError::Internal(err.to_string())
    }
}

impl From<CredentialError> for LifecycleError {
    fn from(err: CredentialError) -> Self {
        LifecycleError::Internal(err.to_string())
    }
}

impl From<ValidationError> for LifecycleError {
    fn from(err: ValidationError) -> Self {
        LifecycleError::Validation(err.to_string())
    }
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait ServiceLifecycleService: Send + Sync {
    /// Start a new instance, record it and route to it.
    async fn deploy(&self, request: DeployRequest) -> Result<ServiceInstance, LifecycleError>;

    /// Stop and forget an instance. A main with shadows cannot be killed.
    async fn kill(&self, key: &ServiceKey, remove_image: bool) -> Result<(), LifecycleError>;

    /// Make `key` the main version of its family.
    async fn assign_main(&self, key: &ServiceKey) -> Result<(), LifecycleError>;

    async fn list(&self) -> Result<Vec<ServiceInstance>, LifecycleError>;

    /// `OutOfSync` when store and runtime disagree. Never heals.
    async fn check_consistency(&self) -> Result<(), LifecycleError>;

    async fn inspect(&self, key: &ServiceKey) -> Result<RuntimeState, LifecycleError>;

    async fn logs(&self, key: &ServiceKey, options: LogOptions) -> Result<LogStream, LifecycleError>;

    /// Rewrite every route file from the store.
    async fn replay_routes(&self) -> Result<ReplaySummary, LifecycleError>;

    /// Load an image archive. Returns the tags it contained.
    async fn load_image(&self, archive: Bytes) -> Result<Vec<String>, LifecycleError>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardServiceLifecycleService {
    repository: Arc<dyn ServiceRepository>,
    runtime: Arc<dyn ServiceRuntime>,
    proxy: Arc<ProxyConfigurator>,
    credentials: Arc<dyn CredentialIssuer>,
    builder: Arc<dyn ImageBuilder>,
    notifier: Arc<dyn Notifier>,
    event_bus: Arc<EventBus>,
    naming: ContainerNaming,
}

impl StandardServiceLifecycleService {
    pub fn new(
        repository: Arc<dyn ServiceRepository>,
        runtime: Arc<dyn ServiceRuntime>,
        proxy: Arc<ProxyConfigurator>,
        credentials: Arc<dyn CredentialIssuer>,
        builder: Arc<dyn ImageBuilder>,
        notifier: Arc<dyn Notifier>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            repository,
            runtime,
            proxy,
            credentials,
            builder,
            notifier,
            event_bus,
            naming: ContainerNaming::default(),
        }
    }

    /// Container naming used when comparing the store with the runtime
    pub fn with_naming(mut self, naming: ContainerNaming) -> Self {
        self.naming = naming;
        self
    }

    fn advance(&self, key: &ServiceKey, stage: &mut DeployStage, next: DeployStage) {
        *stage = next;
        info!(
            service = %key.name,
            version = %key.version,
            stage = next.as_str(),
            "Deploy progressed"
        );
    }

    async fn run_deploy(
        &self,
        request: DeployRequest,
        stage: &mut DeployStage,
    ) -> Result<ServiceInstance, LifecycleError> {
        let key = request.key;

        if self.runtime.exists(&key).await? {
            return Err(LifecycleError::Conflict(format!("Service {} already exists", key)));
        }
        if self.runtime.image_in_use(&key).await? {
            return Err(LifecycleError::Conflict(format!(
                "Image {} is in use by a running service",
                key.image_name()
            )));
        }
        self.advance(&key, stage, DeployStage::Validated);

        let (image, run_options) = match request.source {
            SourceDescriptor::Image { image, run_options } => (image, run_options),
            SourceDescriptor::Git { url } => {
                self.advance(&key, stage, DeployStage::Building);
                // s2i never overwrites an existing tag
                self.runtime.remove_image(&key).await;
                self.builder.build_from_git(&url, &key.image_name()).await?;
                (key.image_name(), RunOptions::default())
            }
            SourceDescriptor::Source { path } => {
                self.advance(&key, stage, DeployStage::Building);
                self.runtime.remove_image(&key).await;
                self.builder.build_from_source(&path, &key.image_name()).await?;
                (key.image_name(), RunOptions::default())
            }
        };

        let credential = self.credentials.issue().await?;
        let mut env = request.env;
        env.insert(ENV_SERVICE_AUTH_TOKEN.to_string(), credential.token.clone());

        self.advance(&key, stage, DeployStage::RuntimeStarting);
        let spec = CreateInstanceSpec {
            key: key.clone(),
            image: image.clone(),
            internal_port: request.port,
            env,
            run_options,
        };
        let url = match self.runtime.create(spec).await {
            Ok(url) => url,
            Err(e) => {
                if let Err(revoke_err) = self.credentials.revoke(credential.id).await {
                    warn!("Failed to revoke credential of {}: {}", key, revoke_err);
                }
                return Err(e.into());
            }
        };
        self.advance(&key, stage, DeployStage::RuntimeStarted);

        let record = NewServiceRecord {
            key: key.clone(),
            image: image.clone(),
            url: url.clone(),
            credential_id: credential.id,
        };
        let instance = match self.repository.add(record).await {
            Ok(instance) => instance,
            Err(RepositoryError::Conflict(msg)) => {
                // A concurrent deploy of the same key won the store; its record stays
                warn!("Service {} was recorded concurrently: {}", key, msg);
                self.notifier.notify(Notification::manager(
                    format!("Service {} was deployed twice concurrently; keeping the first record", key),
                    Severity::Warning,
                ));
                match self.repository.get(&key).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        warn!("Could not re-read record of {}: {}", key, e);
                        unrecorded_instance(&key, image, url, credential.id)
                    }
                }
            }
            Err(e) => {
                error!("Failed to record service {}: {}", key, e);
                self.notifier.notify(Notification::manager(
                    format!("Service {} is running but could not be recorded: {}", key, e),
                    Severity::Critical,
                ));
                unrecorded_instance(&key, image, url, credential.id)
            }
        };
        self.advance(&key, stage, DeployStage::Recorded);

        self.proxy.write_instance_route(&instance).await?;
        match self.repository.family(&key.name).await {
            Ok(family) => {
                if !self.proxy.write_family_route(&family).await? {
                    warn!("Family {} has no main version, skipping mirror route", key.name);
                }
            }
            Err(e) => warn!("Could not read family {}, skipping mirror route: {}", key.name, e),
        }
        self.advance(&key, stage, DeployStage::RoutesWritten);

        Ok(instance)
    }
}

/// Stand-in returned when the store could not record a running instance.
fn unrecorded_instance(
    key: &ServiceKey,
    image: String,
    url: String,
    credential_id: crate::domain::credentials::CredentialId,
) -> ServiceInstance {
    ServiceInstance {
        name: key.name.clone(),
        version: key.version.clone(),
        image,
        url,
        main: false,
        credential_id,
        deployed_at: Utc::now(),
    }
}

#[async_trait]
impl ServiceLifecycleService for StandardServiceLifecycleService {
    async fn deploy(&self, request: DeployRequest) -> Result<ServiceInstance, LifecycleError> {
        let key = request.key.clone();
        let mut stage = DeployStage::Requested;
        info!(service = %key.name, version = %key.version, stage = stage.as_str(), "Deploy requested");

        match self.run_deploy(request, &mut stage).await {
            Ok(instance) => {
                self.advance(&key, &mut stage, DeployStage::Done);
                metrics::counter!("skiff_deployments_total", "outcome" => "success").increment(1);
                self.event_bus.publish_service_event(ServiceEvent::Deployed {
                    name: instance.name.clone(),
                    version: instance.version.clone(),
                    url: instance.url.clone(),
                    main: instance.main,
                    deployed_at: instance.deployed_at,
                });
                Ok(instance)
            }
            Err(e) => {
                warn!(
                    service = %key.name,
                    version = %key.version,
                    stage = stage.as_str(),
                    "Deploy failed: {}",
                    e
                );
                metrics::counter!("skiff_deployments_total", "outcome" => "failure").increment(1);
                self.event_bus.publish_service_event(ServiceEvent::DeployFailed {
                    name: key.name,
                    version: key.version,
                    stage: stage.as_str().to_string(),
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn kill(&self, key: &ServiceKey, remove_image: bool) -> Result<(), LifecycleError> {
        let in_runtime = self.runtime.exists(key).await?;
        let record = match self.repository.get(key).await {
            Ok(record) => Some(record),
            Err(RepositoryError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if !in_runtime && record.is_none() {
            return Err(LifecycleError::NotFound(format!("No such service: {}", key)));
        }

        if record.as_ref().map(|r| r.main).unwrap_or(false) {
            let family = self.repository.family(&key.name).await?;
            if !family.shadows.is_empty() {
                let shadows: Vec<String> = family.shadows.iter().map(ToString::to_string).collect();
                return Err(LifecycleError::Forbidden(format!(
                    "Cannot kill main version {} of {} while shadow versions exist: {}",
                    key.version,
                    key.name,
                    shadows.join(", ")
                )));
            }
        }

        info!("Killing service {}", key);
        self.runtime.remove(key).await?;
        if remove_image {
            self.runtime.remove_image(key).await;
        }

        if let Some(record) = &record {
            if let Err(e) = self.credentials.revoke(record.credential_id).await {
                warn!("Failed to revoke credential of {}: {}", key, e);
            }
        }

        match self.repository.delete(key).await {
            Ok(_) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.proxy.remove_instance_route(key).await?;
        let family = self.repository.family(&key.name).await?;
        if self.proxy.sync_family_route(&family).await? {
            debug!("Rewrote mirror route of {}", key.name);
        }

        metrics::counter!("skiff_kills_total").increment(1);
        self.event_bus.publish_service_event(ServiceEvent::Killed {
            name: key.name.clone(),
            version: key.version.clone(),
            image_removed: remove_image,
            killed_at: Utc::now(),
        });
        Ok(())
    }

    async fn assign_main(&self, key: &ServiceKey) -> Result<(), LifecycleError> {
        self.repository.assign_main(key).await?;

        let family = self.repository.family(&key.name).await?;
        if !self.proxy.write_family_route(&family).await? {
            warn!("Family {} lost its main version during reassignment", key.name);
        }

        info!("Main version of {} is now {}", key.name, key.version);
        metrics::counter!("skiff_main_reassignments_total").increment(1);
        self.event_bus.publish_service_event(ServiceEvent::MainAssigned {
            name: key.name.clone(),
            version: key.version.clone(),
            assigned_at: Utc::now(),
        });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServiceInstance>, LifecycleError> {
        Ok(self.repository.list_all().await?)
    }

    async fn check_consistency(&self) -> Result<(), LifecycleError> {
        let running = self.runtime.list_instances().await?;
        match self.repository.reconcile(&self.naming, &running).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::OutOfSync(report)) => {
                metrics::counter!("skiff_out_of_sync_total").increment(1);
                self.notifier.notify(Notification::manager(
                    format!("Record store out of sync with runtime: {}", report),
                    Severity::Warning,
                ));
                self.event_bus.publish_service_event(ServiceEvent::DriftDetected {
                    report: report.clone(),
                    detected_at: Utc::now(),
                });
                Err(LifecycleError::OutOfSync(report))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect(&self, key: &ServiceKey) -> Result<RuntimeState, LifecycleError> {
        Ok(self.runtime.inspect(key).await?)
    }

    async fn logs(&self, key: &ServiceKey, options: LogOptions) -> Result<LogStream, LifecycleError> {
        Ok(self.runtime.logs(key, options).await?)
    }

    async fn replay_routes(&self) -> Result<ReplaySummary, LifecycleError> {
        let records = self.repository.list_all().await?;
        let summary = self.proxy.replay(&records).await?;
        self.event_bus.publish_service_event(ServiceEvent::RoutesReplayed {
            instances: summary.instances,
            families: summary.families,
            replayed_at: Utc::now(),
        });
        Ok(summary)
    }

    async fn load_image(&self, archive: Bytes) -> Result<Vec<String>, LifecycleError> {
        let tags = self.builder.load_image(archive).await?;
        info!("Loaded uploaded image with tags {:?}", tags);
        Ok(tags)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::routing::{RouteId, RoutingPolicy, StaticProxySettings};
    use crate::domain::service::ServiceName;
    use crate::infrastructure::credentials::LocalCredentialIssuer;
    use crate::infrastructure::event_bus::DomainEvent;
    use crate::infrastructure::proxy::InMemoryRouteStore;
    use crate::infrastructure::repositories::InMemoryServiceRepository;
    use futures::stream;
    use std::collections::HashMap;
    use std::path::Path;
    use tokio::sync::Mutex;

    // Mock ServiceRuntime keyed by container name
    #[derive(Default)]
    pub(crate) struct MockRuntime {
        pub containers: Mutex<HashMap<ServiceKey, CreateInstanceSpec>>,
        pub extra: Mutex<Vec<String>>,
        pub removed_images: Mutex<Vec<String>>,
        pub fail_create: Mutex<Option<String>>,
        next_port: Mutex<u16>,
    }

    #[async_trait]
    impl ServiceRuntime for MockRuntime {
        async fn list_instances(&self) -> Result<Vec<String>, RuntimeError> {
            let naming = ContainerNaming::default();
            let mut names: Vec<String> = self
                .containers
                .lock()
                .await
                .keys()
                .map(|k| format!("/{}", naming.container_name(k)))
                .collect();
            names.extend(self.extra.lock().await.iter().cloned());
            Ok(names)
        }

        async fn exists(&self, key: &ServiceKey) -> Result<bool, RuntimeError> {
            Ok(self.containers.lock().await.contains_key(key))
        }

        async fn image_in_use(&self, key: &ServiceKey) -> Result<bool, RuntimeError> {
            let image = key.image_name();
            Ok(self.containers.lock().await.values().any(|s| s.image == image))
        }

        async fn create(&self, spec: CreateInstanceSpec) -> Result<String, RuntimeError> {
            if let Some(reason) = self.fail_create.lock().await.clone() {
                return Err(RuntimeError::Substrate(reason));
            }
            let mut port = self.next_port.lock().await;
            *port = if *port == 0 { 8001 } else { *port + 1 };
            self.containers.lock().await.insert(spec.key.clone(), spec);
            Ok(format!("http://localhost:{}", *port))
        }

        async fn remove(&self, key: &ServiceKey) -> Result<(), RuntimeError> {
            self.containers.lock().await.remove(key);
            Ok(())
        }

        async fn remove_image(&self, key: &ServiceKey) {
            self.removed_images.lock().await.push(key.image_name());
        }

        async fn inspect(&self, key: &ServiceKey) -> Result<RuntimeState, RuntimeError> {
            let containers = self.containers.lock().await;
            let spec = containers
                .get(key)
                .ok_or_else(|| RuntimeError::NotFound(key.to_string()))?;
            Ok(RuntimeState {
                container_name: ContainerNaming::default().container_name(key),
                status: "running".to_string(),
                running: true,
                image: Some(spec.image.clone()),
                started_at: None,
                finished_at: None,
                exit_code: None,
                restart_count: Some(0),
                ip_address: None,
                detail: serde_json::Value::Null,
            })
        }

        async fn logs(&self, key: &ServiceKey, _options: LogOptions) -> Result<LogStream, RuntimeError> {
            if !self.containers.lock().await.contains_key(key) {
                return Err(RuntimeError::NotFound(key.to_string()));
            }
            let lines = vec![Ok(Bytes::from_static(b"line 1\n")), Ok(Bytes::from_static(b"line 2\n"))];
            Ok(Box::pin(stream::iter(lines)))
        }
    }

    #[derive(Default)]
    pub(crate) struct MockBuilder {
        pub builds: Mutex<Vec<String>>,
        pub fail_with: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ImageBuilder for MockBuilder {
        async fn build_from_source(&self, path: &Path, image: &str) -> Result<(), BuildError> {
            self.build_from_git(&path.to_string_lossy(), image).await
        }

        async fn build_from_git(&self, _url: &str, image: &str) -> Result<(), BuildError> {
            if let Some(detail) = self.fail_with.lock().await.clone() {
                return Err(BuildError::Failed(detail));
            }
            self.builds.lock().await.push(image.to_string());
            Ok(())
        }

        async fn load_image(&self, _archive: Bytes) -> Result<Vec<String>, BuildError> {
            Ok(vec!["uploaded:1.0.0".to_string()])
        }
    }

    pub(crate) struct Harness {
        pub service: StandardServiceLifecycleService,
        pub runtime: Arc<MockRuntime>,
        pub builder: Arc<MockBuilder>,
        pub repository: InMemoryServiceRepository,
        pub routes: InMemoryRouteStore,
        pub credentials: LocalCredentialIssuer,
        pub event_bus: Arc<EventBus>,
    }

    pub(crate) fn harness() -> Harness {
        let repository = InMemoryServiceRepository::new();
        harness_over(repository.clone(), Arc::new(repository))
    }

    /// Harness whose lifecycle service writes through `store`; `repository`
    /// is the in-memory store the assertions read.
    pub(crate) fn harness_over(
        repository: InMemoryServiceRepository,
        store: Arc<dyn ServiceRepository>,
    ) -> Harness {
        let runtime = Arc::new(MockRuntime::default());
        let builder = Arc::new(MockBuilder::default());
        let routes = InMemoryRouteStore::new();
        let credentials = LocalCredentialIssuer::new();
        let event_bus = Arc::new(EventBus::new(64));

        let proxy = Arc::new(ProxyConfigurator::new(
            Arc::new(routes.clone()),
            RoutingPolicy {
                domain: "localhost".to_string(),
                tls: false,
                auth_enabled: false,
            },
            "http://172.17.0.1:8000",
            StaticProxySettings {
                http_port: 5080,
                https_port: 5443,
                dynamic_dir: PathBuf::from("proxy_config/dynamic"),
                https: false,
                email: None,
                acme_storage: PathBuf::from("acme.json"),
                staging_ca: false,
            },
        ));

        let service = StandardServiceLifecycleService::new(
            store,
            runtime.clone(),
            proxy,
            Arc::new(credentials.clone()),
            builder.clone(),
            event_bus.clone(),
            event_bus.clone(),
        );

        Harness {
            service,
            runtime,
            builder,
            repository,
            routes,
            credentials,
            event_bus,
        }
    }

    pub(crate) fn key(name: &str, version: &str) -> ServiceKey {
        ServiceKey::parse(name, version).unwrap()
    }

    pub(crate) fn image_request(name: &str, version: &str) -> DeployRequest {
        DeployRequest {
            key: key(name, version),
            port: 8000,
            env: BTreeMap::new(),
            source: SourceDescriptor::Image {
                image: format!("registry.local/{}:{}", name, version),
                run_options: RunOptions::default(),
            },
        }
    }

    #[tokio::test]
    async fn test_first_deploy_becomes_main_and_is_routed() {
        let h = harness();
        let instance = h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();

        assert!(instance.main);
        assert_eq!(instance.url, "http://localhost:8001");
        assert!(h.routes.get(&RouteId::instance(&instance.key())).await.is_some());
        assert!(h
            .routes
            .get(&RouteId::family(&ServiceName::parse("svc").unwrap()))
            .await
            .is_some());

        let spec = h.runtime.containers.lock().await[&instance.key()].clone();
        assert!(spec.env.contains_key(ENV_SERVICE_AUTH_TOKEN));
        assert_eq!(h.credentials.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_mirror_regenerated_on_family_growth() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        let second = h.service.deploy(image_request("svc", "1.1.0")).await.unwrap();
        assert!(!second.main);

        let mirror = h
            .routes
            .get(&RouteId::family(&ServiceName::parse("svc").unwrap()))
            .await
            .unwrap();
        assert!(mirror.contains("svc_1.0.0"));
        assert!(mirror.contains("svc_1.1.0"));
    }

    #[tokio::test]
    async fn test_deploy_conflicts_with_existing_instance() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();

        let result = h.service.deploy(image_request("svc", "1.0.0")).await;
        assert!(matches!(result, Err(LifecycleError::Conflict(_))));
        assert_eq!(h.repository.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_revokes_credential_and_records_nothing() {
        let h = harness();
        *h.runtime.fail_create.lock().await = Some("daemon unavailable".to_string());
        let mut events = h.event_bus.subscribe();

        let result = h.service.deploy(image_request("svc", "1.0.0")).await;
        assert!(matches!(result, Err(LifecycleError::Substrate(_))));
        assert_eq!(h.credentials.active_count().await, 0);
        assert!(h.repository.list_all().await.unwrap().is_empty());
        assert!(h.routes.file_names().await.is_empty());

        match events.try_recv().unwrap() {
            DomainEvent::Service(ServiceEvent::DeployFailed { stage, .. }) => {
                assert_eq!(stage, "runtime_starting")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_runtime_name_clash_is_a_conflict() {
        let err = LifecycleError::from(RuntimeError::Conflict("skiff-svc-1.0.0".to_string()));
        assert!(matches!(err, LifecycleError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_existing_record_wins_when_store_rejects_duplicate() {
        let h = harness();
        let existing = h
            .repository
            .add(NewServiceRecord {
                key: key("svc", "1.0.0"),
                image: "svc:1.0.0".to_string(),
                url: "http://localhost:9999".to_string(),
                credential_id: crate::domain::credentials::CredentialId::new(),
            })
            .await
            .unwrap();
        let mut events = h.event_bus.subscribe();

        let instance = h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();

        assert_eq!(instance.url, existing.url);
        assert_eq!(instance.credential_id, existing.credential_id);
        let stored = h.repository.get(&key("svc", "1.0.0")).await.unwrap();
        assert_eq!(stored.url, "http://localhost:9999");
        assert_eq!(h.repository.list_all().await.unwrap().len(), 1);

        let instance_route = h.routes.get(&RouteId::instance(&key("svc", "1.0.0"))).await.unwrap();
        assert!(instance_route.contains("http://localhost:9999"));
        assert!(h
            .routes
            .get(&RouteId::family(&ServiceName::parse("svc").unwrap()))
            .await
            .is_some());

        match events.try_recv().unwrap() {
            DomainEvent::Notification(n) => assert_eq!(n.severity, Severity::Warning),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // Store whose inserts always fail; reads go to the wrapped store
    struct FailingAddRepository {
        inner: InMemoryServiceRepository,
    }

    #[async_trait]
    impl ServiceRepository for FailingAddRepository {
        async fn get(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
            self.inner.get(key).await
        }

        async fn get_main(&self, name: &ServiceName) -> Result<ServiceInstance, RepositoryError> {
            self.inner.get_main(name).await
        }

        async fn add(&self, _record: NewServiceRecord) -> Result<ServiceInstance, RepositoryError> {
            Err(RepositoryError::Database("disk I/O error".to_string()))
        }

        async fn delete(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
            self.inner.delete(key).await
        }

        async fn assign_main(&self, key: &ServiceKey) -> Result<(), RepositoryError> {
            self.inner.assign_main(key).await
        }

        async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError> {
            self.inner.list_all().await
        }
    }

    #[tokio::test]
    async fn test_store_failure_after_start_is_tolerated_and_notified() {
        let repository = InMemoryServiceRepository::new();
        let h = harness_over(
            repository.clone(),
            Arc::new(FailingAddRepository { inner: repository }),
        );
        let mut events = h.event_bus.subscribe();

        let instance = h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();

        assert_eq!(instance.url, "http://localhost:8001");
        assert!(!instance.main);
        assert!(h.runtime.containers.lock().await.contains_key(&key("svc", "1.0.0")));
        assert!(h.repository.list_all().await.unwrap().is_empty());
        assert!(h.routes.get(&RouteId::instance(&instance.key())).await.is_some());
        // No recorded main, so no mirror route
        assert!(h
            .routes
            .get(&RouteId::family(&ServiceName::parse("svc").unwrap()))
            .await
            .is_none());

        match events.try_recv().unwrap() {
            DomainEvent::Notification(n) => assert_eq!(n.severity, Severity::Critical),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.try_recv().unwrap() {
            DomainEvent::Service(ServiceEvent::Deployed { .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_git_deploy_removes_stale_image_then_builds() {
        let h = harness();
        let request = DeployRequest {
            source: SourceDescriptor::Git {
                url: "https://git.example.test/svc.git".to_string(),
            },
            ..image_request("svc", "2.0.0")
        };
        let instance = h.service.deploy(request).await.unwrap();

        assert_eq!(instance.image, "svc:2.0.0");
        assert_eq!(*h.runtime.removed_images.lock().await, vec!["svc:2.0.0"]);
        assert_eq!(*h.builder.builds.lock().await, vec!["svc:2.0.0"]);
    }

    #[tokio::test]
    async fn test_build_failure_surfaces_error_lines() {
        let h = harness();
        *h.builder.fail_with.lock().await = Some("ERROR: no requirements.txt".to_string());
        let request = DeployRequest {
            source: SourceDescriptor::Source {
                path: PathBuf::from("/tmp/svc"),
            },
            ..image_request("svc", "1.0.0")
        };

        match h.service.deploy(request).await {
            Err(LifecycleError::Build(detail)) => assert_eq!(detail, "ERROR: no requirements.txt"),
            other => panic!("unexpected result: {:?}", other.map(|i| i.key())),
        }
        assert!(h.runtime.containers.lock().await.is_empty());
        assert_eq!(h.credentials.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_kill_main_with_shadows_is_forbidden() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.deploy(image_request("svc", "1.1.0")).await.unwrap();

        let result = h.service.kill(&key("svc", "1.0.0"), false).await;
        assert!(matches!(result, Err(LifecycleError::Forbidden(_))));
        assert_eq!(h.repository.list_all().await.unwrap().len(), 2);
        assert_eq!(h.runtime.containers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_kill_shadow_rewrites_mirror() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.deploy(image_request("svc", "1.1.0")).await.unwrap();

        h.service.kill(&key("svc", "1.1.0"), true).await.unwrap();

        assert!(h.routes.get(&RouteId::instance(&key("svc", "1.1.0"))).await.is_none());
        let mirror = h
            .routes
            .get(&RouteId::family(&ServiceName::parse("svc").unwrap()))
            .await
            .unwrap();
        assert!(!mirror.contains("svc_1.1.0"));
        assert_eq!(*h.runtime.removed_images.lock().await, vec!["svc:1.1.0"]);
        assert_eq!(h.credentials.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_kill_last_instance_removes_family_route() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.kill(&key("svc", "1.0.0"), false).await.unwrap();

        assert!(h.routes.file_names().await.is_empty());
        assert!(h.repository.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_unknown_service_is_not_found() {
        let h = harness();
        let result = h.service.kill(&key("ghost", "1.0.0"), false).await;
        assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_assign_main_round_trip() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.deploy(image_request("svc", "1.1.0")).await.unwrap();
        let family_id = RouteId::family(&ServiceName::parse("svc").unwrap());
        let original = h.routes.get(&family_id).await.unwrap();

        h.service.assign_main(&key("svc", "1.1.0")).await.unwrap();
        let name = ServiceName::parse("svc").unwrap();
        assert_eq!(h.repository.get_main(&name).await.unwrap().version.to_string(), "1.1.0");
        assert_ne!(h.routes.get(&family_id).await.unwrap(), original);

        h.service.assign_main(&key("svc", "1.0.0")).await.unwrap();
        assert_eq!(h.routes.get(&family_id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_assign_unknown_version_is_not_found() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        let result = h.service.assign_main(&key("svc", "9.9.9")).await;
        assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_consistency_reports_drift_without_healing() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.check_consistency().await.unwrap();

        h.runtime.extra.lock().await.push("/skiff-stray-0.1.0".to_string());
        match h.service.check_consistency().await {
            Err(LifecycleError::OutOfSync(report)) => {
                assert_eq!(report.extra, vec!["skiff-stray-0.1.0"]);
                assert!(report.missing.is_empty());
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(h.repository.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inspect_and_logs_of_unknown_service() {
        let h = harness();
        let missing = key("ghost", "1.0.0");
        assert!(matches!(h.service.inspect(&missing).await, Err(LifecycleError::NotFound(_))));
        assert!(matches!(
            h.service.logs(&missing, LogOptions::default()).await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replay_restores_routes() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.service.deploy(image_request("other", "0.1.0")).await.unwrap();

        let family_id = RouteId::family(&ServiceName::parse("svc").unwrap());
        let before = h.routes.get(&family_id).await.unwrap();

        let summary = h.service.replay_routes().await.unwrap();
        assert_eq!(summary, ReplaySummary { instances: 2, families: 2 });
        assert_eq!(h.routes.file_names().await.len(), 4);
        assert_eq!(h.routes.get(&family_id).await.unwrap(), before);
    }
}
