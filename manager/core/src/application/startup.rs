// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Startup sequence, run once after every dependency is constructed:
// proxy bootstrap, route replay, then a report-only consistency check.

use tracing::{info, warn};

use crate::application::lifecycle::{LifecycleError, ServiceLifecycleService};
use crate::application::routing::{ProxyConfigurator, ReplaySummary};
use crate::domain::notification::{Notification, Notifier, Severity};
use crate::domain::repository::SyncReport;

#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub https: bool,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub replayed: ReplaySummary,
    /// Drift found by the consistency check, if any
    pub drift: Option<SyncReport>,
}

pub async fn run_startup(
    proxy: &ProxyConfigurator,
    lifecycle: &dyn ServiceLifecycleService,
    notifier: &dyn Notifier,
    options: &StartupOptions,
) -> Result<StartupReport, LifecycleError> {
    if options.https && options.email.is_none() {
        notifier.notify(Notification::manager(
            "HTTPS is enabled but no email is configured; certificate expiry notices will not be delivered",
            Severity::Warning,
        ));
    }

    proxy.bootstrap().await?;
    let replayed = lifecycle.replay_routes().await?;

    let drift = match lifecycle.check_consistency().await {
        Ok(()) => None,
        Err(LifecycleError::OutOfSync(report)) => Some(report),
        Err(e) => {
            warn!("Startup consistency check failed: {}", e);
            None
        }
    };

    info!(
        instances = replayed.instances,
        families = replayed.families,
        in_sync = drift.is_none(),
        "Manager startup complete"
    );
    Ok(StartupReport { replayed, drift })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lifecycle::tests::{harness, image_request};
    use crate::application::routing::ProxyConfigurator;
    use crate::domain::routing::{RoutingPolicy, StaticProxySettings};
    use crate::infrastructure::event_bus::{DomainEvent, EventBus};
    use crate::infrastructure::proxy::InMemoryRouteStore;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn proxy(store: &InMemoryRouteStore, https: bool) -> ProxyConfigurator {
        ProxyConfigurator::new(
            Arc::new(store.clone()),
            RoutingPolicy {
                domain: "localhost".to_string(),
                tls: https,
                auth_enabled: false,
            },
            "http://172.17.0.1:8000",
            StaticProxySettings {
                http_port: 5080,
                https_port: 5443,
                dynamic_dir: PathBuf::from("proxy_config/dynamic"),
                https,
                email: None,
                acme_storage: PathBuf::from("acme.json"),
                staging_ca: false,
            },
        )
    }

    #[tokio::test]
    async fn test_startup_replays_and_reports_drift() {
        let h = harness();
        h.service.deploy(image_request("svc", "1.0.0")).await.unwrap();
        h.runtime.extra.lock().await.push("/skiff-stray-0.1.0".to_string());

        let store = InMemoryRouteStore::new();
        let notifier = EventBus::new(8);
        let report = run_startup(&proxy(&store, false), &h.service, &notifier, &StartupOptions::default())
            .await
            .unwrap();

        assert_eq!(report.replayed.instances, 1);
        assert_eq!(report.drift.unwrap().extra, vec!["skiff-stray-0.1.0"]);
        // Bootstrap files land in the startup store; replayed routes in the harness store
        assert_eq!(store.file_names().await.len(), 3);
        assert_eq!(h.routes.file_names().await.len(), 2);
    }

    #[tokio::test]
    async fn test_https_without_email_notifies() {
        let h = harness();
        let store = InMemoryRouteStore::new();
        let notifier = EventBus::new(8);
        let mut receiver = notifier.subscribe();
        let options = StartupOptions {
            https: true,
            email: None,
        };

        run_startup(&proxy(&store, true), &h.service, &notifier, &options)
            .await
            .unwrap();

        match receiver.try_recv().unwrap() {
            DomainEvent::Notification(n) => assert_eq!(n.severity, Severity::Warning),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(store.static_config().await.unwrap().contains("cert-resolver"));
    }
}
