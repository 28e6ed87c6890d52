// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::RemoveImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, HostConfigLogConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::manager_config::ManagerConfigManifest;
use crate::domain::runtime::{
    CreateInstanceSpec, LogOptions, LogStream, RuntimeError, RuntimeState, ServiceRuntime,
};
use crate::domain::service::{ContainerNaming, ServiceKey};

pub const TYPE_LABEL: &str = "skiff.type";
pub const NAME_LABEL: &str = "skiff.name";
pub const VERSION_LABEL: &str = "skiff.version";
pub const SERVICE_TYPE: &str = "service";
pub const MANAGER_TYPE: &str = "manager";
/// Network alias of the manager container when it runs on the service network
pub const MANAGER_NETWORK_ALIAS: &str = "skiff-manager";

pub const ENV_MANAGER_URL: &str = "SKIFF_MANAGER_URL";
pub const ENV_MANAGER_HOSTNAME: &str = "SKIFF_MANAGER_HOSTNAME";
pub const ENV_SERVICE_NAME: &str = "SKIFF_SERVICE_NAME";
pub const ENV_SERVICE_VERSION: &str = "SKIFF_SERVICE_VERSION";

const PORT_ALLOCATED: &str = "port is already allocated";

#[derive(Debug, Clone)]
pub struct DockerRuntimeSettings {
    pub naming: ContainerNaming,
    pub network: String,
    pub first_external_port: u16,
    pub max_port_attempts: u16,
    pub restart_policy_grace: Duration,
    pub manager_in_container: bool,
    /// Manager URL handed to every service
    pub manager_url: String,
    pub manager_hostname: String,
}

impl DockerRuntimeSettings {
    pub fn from_config(config: &ManagerConfigManifest) -> Self {
        let spec = &config.spec;
        let manager_host = if spec.manager.in_container {
            MANAGER_NETWORK_ALIAS.to_string()
        } else {
            spec.runtime.host_gateway.clone()
        };

        Self {
            naming: ContainerNaming::new(spec.runtime.container_prefix.clone()),
            network: spec.runtime.network.clone(),
            first_external_port: spec.runtime.first_external_port,
            max_port_attempts: spec.runtime.max_port_attempts,
            restart_policy_grace: Duration::from_secs(spec.runtime.restart_policy_grace_seconds),
            manager_in_container: spec.manager.in_container,
            manager_url: format!("http://{}:{}", manager_host, spec.proxy.http_port),
            manager_hostname: spec.proxy.domain.clone(),
        }
    }
}

/// Failed create/start attempt. `container_created` tells the caller whether
/// a half-created container needs removing.
#[derive(Debug)]
pub struct StartAttemptError {
    pub error: RuntimeError,
    pub container_created: bool,
}

/// Runs `attempt` on consecutive host ports starting at `first_port` until one
/// is free. Every failed attempt that left a container behind is followed by
/// `cleanup`, so no orphan survives a retry or a final failure. Errors other
/// than a port clash end the loop immediately.
pub async fn start_with_port_retry<A, AFut, C, CFut>(
    first_port: u16,
    max_attempts: u16,
    mut attempt: A,
    mut cleanup: C,
) -> Result<u16, RuntimeError>
where
    A: FnMut(u16) -> AFut,
    AFut: Future<Output = Result<(), StartAttemptError>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = ()>,
{
    let mut port = first_port;
    for _ in 0..max_attempts {
        match attempt(port).await {
            Ok(()) => return Ok(port),
            Err(failure) => {
                if failure.container_created {
                    cleanup().await;
                }
                match failure.error {
                    RuntimeError::PortAllocated(_) => {
                        info!("Port {} already in use, trying next one", port);
                        port = port.checked_add(1).ok_or_else(|| {
                            RuntimeError::Substrate("host port range exhausted".to_string())
                        })?;
                    }
                    other => return Err(other),
                }
            }
        }
    }

    Err(RuntimeError::Substrate(format!(
        "no free host port after {} attempts starting at {}",
        max_attempts, first_port
    )))
}

/// Environment for a service container. Manager-provided variables win over
/// caller-supplied ones.
pub fn service_environment(
    settings: &DockerRuntimeSettings,
    spec: &CreateInstanceSpec,
) -> BTreeMap<String, String> {
    let mut env = spec.env.clone();
    env.insert(ENV_MANAGER_URL.to_string(), settings.manager_url.clone());
    env.insert(ENV_MANAGER_HOSTNAME.to_string(), settings.manager_hostname.clone());
    env.insert(ENV_SERVICE_NAME.to_string(), spec.key.name.to_string());
    env.insert(ENV_SERVICE_VERSION.to_string(), spec.key.version.to_string());
    env
}

/// Container definition for one create attempt. `external_port` is `None`
/// when the manager shares the service network and needs no host port.
pub fn container_config(
    settings: &DockerRuntimeSettings,
    spec: &CreateInstanceSpec,
    external_port: Option<u16>,
) -> Config<String> {
    let port_key = format!("{}/tcp", spec.internal_port);

    let mut labels: HashMap<String, String> = spec.run_options.labels.clone().into_iter().collect();
    labels.insert(TYPE_LABEL.to_string(), SERVICE_TYPE.to_string());
    labels.insert(NAME_LABEL.to_string(), spec.key.name.to_string());
    labels.insert(VERSION_LABEL.to_string(), spec.key.version.to_string());

    let env: Vec<String> = service_environment(settings, spec)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let port_bindings = external_port.map(|port| {
        HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        )])
    });

    let host_config = HostConfig {
        network_mode: Some(settings.network.clone()),
        port_bindings,
        log_config: Some(HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::from([
                ("max-size".to_string(), "100m".to_string()),
                ("max-file".to_string(), "3".to_string()),
            ])),
        }),
        binds: (!spec.run_options.binds.is_empty()).then(|| spec.run_options.binds.clone()),
        memory: spec.run_options.memory_bytes,
        // 1 CPU = 1e9 nano CPUs
        nano_cpus: spec.run_options.cpu_millis.map(|m| i64::from(m) * 1_000_000),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.run_options.command.clone(),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn map_docker_error(err: DockerError, context: &str) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, message } => {
            RuntimeError::NotFound(format!("{}: {}", context, message))
        }
        DockerError::DockerResponseServerError { status_code: 409, message } => {
            RuntimeError::Conflict(format!("{}: {}", context, message))
        }
        DockerError::DockerResponseServerError { message, .. } if message.contains(PORT_ALLOCATED) => {
            RuntimeError::PortAllocated(message)
        }
        other => RuntimeError::Substrate(format!("{}: {}", context, other)),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

pub struct DockerRuntime {
    docker: Docker,
    settings: DockerRuntimeSettings,
}

impl DockerRuntime {
    pub fn new(socket_path: Option<String>, settings: DockerRuntimeSettings) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = socket_path {
            Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                RuntimeError::Substrate(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::Substrate(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self { docker, settings })
    }

    pub fn naming(&self) -> &ContainerNaming {
        &self.settings.naming
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::Substrate(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    /// Create the service network, reusing it if it already exists. When the
    /// manager runs in a container, also attach that container to the network
    /// under [`MANAGER_NETWORK_ALIAS`].
    pub async fn ensure_network(&self) -> Result<(), RuntimeError> {
        let network = self.settings.network.clone();
        match self
            .docker
            .inspect_network(&network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => info!("Docker network {} already exists, reusing", network),
            Err(e) if is_not_found(&e) => {
                self.docker
                    .create_network(CreateNetworkOptions {
                        name: network.clone(),
                        check_duplicate: true,
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| map_docker_error(e, "create network"))?;
                info!("Created Docker network {}", network);
            }
            Err(e) => return Err(map_docker_error(e, "inspect network")),
        }

        if self.settings.manager_in_container {
            self.attach_manager(&network).await?;
        }
        Ok(())
    }

    async fn attach_manager(&self, network: &str) -> Result<(), RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", TYPE_LABEL, MANAGER_TYPE)],
        )]);
        let managers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error(e, "list manager containers"))?;

        let manager_id = match managers.as_slice() {
            [only] => only.id.clone().unwrap_or_default(),
            [] => {
                return Err(RuntimeError::Substrate(format!(
                    "no container labelled {}={} found",
                    TYPE_LABEL, MANAGER_TYPE
                )))
            }
            _ => {
                return Err(RuntimeError::Substrate(
                    "multiple manager containers found on this Docker host".to_string(),
                ))
            }
        };

        let inspected = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
            .map_err(|e| map_docker_error(e, "inspect network"))?;
        let already_attached = inspected
            .containers
            .map(|containers| containers.contains_key(&manager_id))
            .unwrap_or(false);
        if already_attached {
            info!("Manager already connected to {}, reusing connection", network);
            return Ok(());
        }

        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: manager_id,
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![MANAGER_NETWORK_ALIAS.to_string()]),
                        ..Default::default()
                    },
                },
            )
            .await
            .map_err(|e| map_docker_error(e, "connect manager to network"))?;
        Ok(())
    }

    async fn service_containers(&self) -> Result<Vec<bollard::models::ContainerSummary>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", TYPE_LABEL, SERVICE_TYPE)],
        )]);
        self.docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error(e, "list service containers"))
    }

    async fn create_and_start(
        &self,
        spec: &CreateInstanceSpec,
        external_port: Option<u16>,
    ) -> Result<(), StartAttemptError> {
        let name = self.settings.naming.container_name(&spec.key);
        let config = container_config(&self.settings, spec, external_port);

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| StartAttemptError {
                error: if is_not_found(&e) {
                    RuntimeError::ImageNotFound(spec.image.clone())
                } else {
                    map_docker_error(e, "create container")
                },
                container_created: false,
            })?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| StartAttemptError {
                error: map_docker_error(e, "start container"),
                container_created: true,
            })?;

        Ok(())
    }

    async fn remove_quietly(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            if !is_not_found(&e) {
                warn!("Failed to remove half-created container {}: {}", name, e);
            }
        }
    }

    /// Let a fresh container run for a grace period, then make Docker restart
    /// it on failure or daemon restart. Failure is only logged.
    fn schedule_restart_policy_upgrade(&self, name: String) {
        let docker = self.docker.clone();
        let grace = self.settings.restart_policy_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let options = UpdateContainerOptions::<String> {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ALWAYS),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            };
            match docker.update_container(&name, options).await {
                Ok(_) => info!("Updated restart policy on {}", name),
                Err(e) => warn!("Failed to update restart policy on {}: {}", name, e),
            }
        });
    }
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    async fn list_instances(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self.service_containers().await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|names| names.into_iter().next()))
            .map(|name| name.trim_start_matches('/').to_string())
            .collect())
    }

    async fn exists(&self, key: &ServiceKey) -> Result<bool, RuntimeError> {
        let name = self.settings.naming.container_name(key);
        match self.docker.inspect_container(&name, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_docker_error(e, "inspect container")),
        }
    }

    async fn image_in_use(&self, key: &ServiceKey) -> Result<bool, RuntimeError> {
        let image = key.image_name();
        let containers = self.service_containers().await?;
        Ok(containers
            .iter()
            .any(|c| c.image.as_deref() == Some(image.as_str())))
    }

    async fn create(&self, spec: CreateInstanceSpec) -> Result<String, RuntimeError> {
        let name = self.settings.naming.container_name(&spec.key);

        let url = if self.settings.manager_in_container {
            if let Err(failure) = self.create_and_start(&spec, None).await {
                if failure.container_created {
                    self.remove_quietly(&name).await;
                }
                return Err(failure.error);
            }
            // Reachable by container name on the shared network
            format!("http://{}:{}", name, spec.internal_port)
        } else {
            let port = start_with_port_retry(
                self.settings.first_external_port,
                self.settings.max_port_attempts,
                |port| self.create_and_start(&spec, Some(port)),
                || self.remove_quietly(&name),
            )
            .await?;
            format!("http://localhost:{}", port)
        };

        info!("Started service container {} at {}", name, url);
        self.schedule_restart_policy_upgrade(name);
        Ok(url)
    }

    async fn remove(&self, key: &ServiceKey) -> Result<(), RuntimeError> {
        let name = self.settings.naming.container_name(key);
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&name, Some(options)).await {
            Ok(()) => {
                info!("Removed service container {}", name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("Service container {} was already gone", name);
                Ok(())
            }
            Err(e) => Err(map_docker_error(e, "remove container")),
        }
    }

    async fn remove_image(&self, key: &ServiceKey) {
        let image = key.image_name();
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(&image, Some(options), None).await {
            Ok(_) => info!("Deleted image {}", image),
            Err(e) if is_not_found(&e) => info!("Image {} did not exist", image),
            Err(e) => warn!("Failed to delete image {}: {}", image, e),
        }
    }

    async fn inspect(&self, key: &ServiceKey) -> Result<RuntimeState, RuntimeError> {
        let name = self.settings.naming.container_name(key);
        let info = self
            .docker
            .inspect_container(&name, None)
            .await
            .map_err(|e| map_docker_error(e, &name))?;

        let detail = serde_json::to_value(&info)
            .map_err(|e| RuntimeError::Substrate(format!("inspect {}: {}", name, e)))?;
        let state = info.state.unwrap_or_default();
        let ip_address = info
            .network_settings
            .and_then(|n| n.networks)
            .and_then(|mut networks| networks.remove(&self.settings.network))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty());

        Ok(RuntimeState {
            container_name: name,
            status: state
                .status
                .map(|s| format!("{:?}", s).to_lowercase())
                .unwrap_or_else(|| "unknown".to_string()),
            running: state.running.unwrap_or(false),
            image: info.config.and_then(|c| c.image),
            started_at: state.started_at,
            finished_at: state.finished_at,
            exit_code: state.exit_code,
            restart_count: info.restart_count,
            ip_address,
            detail,
        })
    }

    async fn logs(&self, key: &ServiceKey, options: LogOptions) -> Result<LogStream, RuntimeError> {
        let name = self.settings.naming.container_name(key);
        if !self.exists(key).await? {
            return Err(RuntimeError::NotFound(name));
        }

        let logs_options = LogsOptions::<String> {
            follow: options.follow,
            stdout: true,
            stderr: true,
            since: options.since.map(|t| t.timestamp()).unwrap_or(0),
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let docker = self.docker.clone();
        let stream = async_stream::stream! {
            let mut logs = docker.logs(&name, Some(logs_options));
            while let Some(item) = logs.next().await {
                yield item
                    .map(LogOutput::into_bytes)
                    .map_err(|e| RuntimeError::Substrate(format!("logs {}: {}", name, e)));
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime::RunOptions;
    use std::sync::{Arc, Mutex};

    fn settings(in_container: bool) -> DockerRuntimeSettings {
        let mut config = ManagerConfigManifest::default();
        config.spec.manager.in_container = in_container;
        config.spec.proxy.domain = "apps.example.test".to_string();
        DockerRuntimeSettings::from_config(&config)
    }

    fn spec() -> CreateInstanceSpec {
        CreateInstanceSpec {
            key: ServiceKey::parse("svc", "1.0.0").unwrap(),
            image: "svc:1.0.0".to_string(),
            internal_port: 8000,
            env: BTreeMap::from([
                ("CUSTOM".to_string(), "value".to_string()),
                (ENV_SERVICE_NAME.to_string(), "spoofed".to_string()),
            ]),
            run_options: RunOptions {
                labels: BTreeMap::from([("team".to_string(), "data".to_string())]),
                cpu_millis: Some(500),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_settings_manager_url() {
        assert_eq!(settings(false).manager_url, "http://172.17.0.1:5080");
        assert_eq!(settings(true).manager_url, "http://skiff-manager:5080");
        assert_eq!(settings(true).manager_hostname, "apps.example.test");
    }

    #[test]
    fn test_standard_environment_overrides_caller() {
        let env = service_environment(&settings(false), &spec());
        assert_eq!(env["CUSTOM"], "value");
        assert_eq!(env[ENV_SERVICE_NAME], "svc");
        assert_eq!(env[ENV_SERVICE_VERSION], "1.0.0");
        assert_eq!(env[ENV_MANAGER_URL], "http://172.17.0.1:5080");
    }

    #[test]
    fn test_container_config_layout() {
        let config = container_config(&settings(false), &spec(), Some(8003));
        let labels = config.labels.as_ref().unwrap();
        assert_eq!(labels[TYPE_LABEL], SERVICE_TYPE);
        assert_eq!(labels["team"], "data");

        let host = config.host_config.as_ref().unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("skiff-network"));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        let bindings = host.port_bindings.as_ref().unwrap();
        let binding = bindings["8000/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8003"));

        let log = host.log_config.as_ref().unwrap();
        assert_eq!(log.typ.as_deref(), Some("json-file"));
        assert_eq!(log.config.as_ref().unwrap()["max-file"], "3");
    }

    #[test]
    fn test_container_config_without_host_port() {
        let config = container_config(&settings(true), &spec(), None);
        assert!(config.host_config.unwrap().port_bindings.is_none());
        assert!(config.exposed_ports.unwrap().contains_key("8000/tcp"));
    }

    #[tokio::test]
    async fn test_port_retry_skips_allocated_ports_without_orphans() {
        let taken = [8001u16, 8002];
        let live: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
        let attempts: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));

        let port = start_with_port_retry(
            8001,
            10,
            |port| {
                let live = live.clone();
                let attempts = attempts.clone();
                async move {
                    attempts.lock().unwrap().push(port);
                    // create succeeds, start fails on a taken port
                    live.lock().unwrap().push(port);
                    if taken.contains(&port) {
                        Err(StartAttemptError {
                            error: RuntimeError::PortAllocated(format!(
                                "Bind for 0.0.0.0:{} failed: port is already allocated",
                                port
                            )),
                            container_created: true,
                        })
                    } else {
                        Ok(())
                    }
                }
            },
            || {
                let live = live.clone();
                async move {
                    live.lock().unwrap().pop();
                }
            },
        )
        .await
        .expect("a free port");

        assert_eq!(port, 8003);
        assert_eq!(*attempts.lock().unwrap(), vec![8001, 8002, 8003]);
        assert_eq!(*live.lock().unwrap(), vec![8003]);
    }

    #[tokio::test]
    async fn test_port_retry_is_bounded() {
        let cleanups = Arc::new(Mutex::new(0));
        let result = start_with_port_retry(
            8001,
            3,
            |port| async move {
                Err(StartAttemptError {
                    error: RuntimeError::PortAllocated(port.to_string()),
                    container_created: true,
                })
            },
            || {
                let cleanups = cleanups.clone();
                async move {
                    *cleanups.lock().unwrap() += 1;
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::Substrate(_))));
        assert_eq!(*cleanups.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_port_retry_stops_on_other_errors() {
        let cleanups = Arc::new(Mutex::new(0));
        let result = start_with_port_retry(
            8001,
            10,
            |_| async {
                Err(StartAttemptError {
                    error: RuntimeError::ImageNotFound("svc:1.0.0".to_string()),
                    container_created: false,
                })
            },
            || {
                let cleanups = cleanups.clone();
                async move {
                    *cleanups.lock().unwrap() += 1;
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RuntimeError::ImageNotFound(_))));
        assert_eq!(*cleanups.lock().unwrap(), 0);
    }

    #[test]
    fn test_docker_error_mapping() {
        let port_clash = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "driver failed programming external connectivity: Bind for 0.0.0.0:8001 failed: port is already allocated".to_string(),
        };
        assert!(matches!(
            map_docker_error(port_clash, "start"),
            RuntimeError::PortAllocated(_)
        ));

        let missing = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: skiff-svc-1.0.0".to_string(),
        };
        assert!(matches!(map_docker_error(missing, "inspect"), RuntimeError::NotFound(_)));
    }

    #[test]
    fn test_name_clash_maps_to_conflict() {
        let clash = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "Conflict. The container name \"/skiff-svc-1.0.0\" is already in use by container \"3f2a\"".to_string(),
        };
        assert!(matches!(
            map_docker_error(clash, "create container"),
            RuntimeError::Conflict(_)
        ));
    }
}
