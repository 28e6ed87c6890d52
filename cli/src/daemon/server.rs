// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Manager HTTP server

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use skiff_manager_core::{
    application::{
        lifecycle::{ServiceLifecycleService, StandardServiceLifecycleService},
        routing::ProxyConfigurator,
        startup::{run_startup, StartupOptions},
    },
    domain::{
        manager_config::{ManagerConfigManifest, StorageBackend},
        repository::ServiceRepository,
    },
    infrastructure::{
        builder::S2iImageBuilder,
        credentials::LocalCredentialIssuer,
        db::Database,
        event_bus::EventBus,
        proxy::FileRouteStore,
        repositories::{InMemoryServiceRepository, SqliteServiceRepository},
        runtime::{DockerRuntime, DockerRuntimeSettings},
    },
    presentation::api::{app, AppState},
};

pub async fn start_daemon(config: ManagerConfigManifest) -> Result<()> {
    info!(
        "Configuration loaded: name={}, domain={}",
        config.metadata.name, config.spec.proxy.domain
    );

    std::fs::create_dir_all(&config.spec.manager.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {:?}",
            config.spec.manager.data_dir
        )
    })?;

    let repository: Arc<dyn ServiceRepository> = match config.spec.database.backend {
        StorageBackend::Sqlite => {
            let url = config.database_url();
            info!("Opening record store at {}", url);
            let db = Database::new(&url).await?;
            Arc::new(SqliteServiceRepository::new(db.get_pool().clone()))
        }
        StorageBackend::Memory => {
            warn!("Using the in-memory record store; records are lost on restart");
            Arc::new(InMemoryServiceRepository::default())
        }
    };

    let settings = DockerRuntimeSettings::from_config(&config);
    let naming = settings.naming.clone();
    let runtime = DockerRuntime::new(config.spec.runtime.docker_socket_path.clone(), settings)
        .context("Failed to connect to Docker")?;
    runtime
        .healthcheck()
        .await
        .context("Docker is not reachable")?;
    runtime
        .ensure_network()
        .await
        .context("Failed to prepare the service network")?;

    let route_store = FileRouteStore::new(
        config.spec.proxy.config_path.clone(),
        config.dynamic_config_dir(),
    );
    let proxy = Arc::new(ProxyConfigurator::new(
        Arc::new(route_store),
        config.routing_policy(),
        config.spec.manager.internal_url.clone(),
        config.static_proxy_settings(),
    ));

    let event_bus = Arc::new(EventBus::with_default_capacity());
    let lifecycle = Arc::new(
        StandardServiceLifecycleService::new(
            repository,
            Arc::new(runtime),
            proxy.clone(),
            Arc::new(LocalCredentialIssuer::new()),
            Arc::new(S2iImageBuilder::new(config.spec.runtime.builder_image.clone())),
            event_bus.clone(),
            event_bus.clone(),
        )
        .with_naming(naming),
    );

    let report = run_startup(
        &proxy,
        lifecycle.as_ref(),
        event_bus.as_ref(),
        &StartupOptions {
            https: config.spec.proxy.https,
            email: config.spec.manager.email.clone(),
        },
    )
    .await
    .context("Startup sequence failed")?;
    if let Some(drift) = &report.drift {
        warn!(
            "Runtime and record store disagree: extra={:?} missing={:?}",
            drift.extra, drift.missing
        );
    }

    start_metrics_exporter(&config)?;

    let lifecycle: Arc<dyn ServiceLifecycleService> = lifecycle;
    let router = app(AppState::new(lifecycle, event_bus));

    let addr = format!("{}:{}", config.spec.network.bind_address, config.spec.network.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Manager listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Manager shutting down");

    Ok(())
}

fn start_metrics_exporter(config: &ManagerConfigManifest) -> Result<()> {
    let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    else {
        return Ok(());
    };

    let addr: SocketAddr = format!("{}:{}", config.spec.network.bind_address, metrics.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid metrics listen address {}:{}",
                config.spec.network.bind_address, metrics.port
            )
        })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to start Prometheus exporter")?;

    info!("Prometheus metrics on {}", addr);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
