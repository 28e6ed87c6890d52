// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Proxy Configurator
//!
//! Turns record-store state into proxy route files. It owns no state of its
//! own: every file it writes can be regenerated from the records, which is
//! what [`ProxyConfigurator::replay`] does at startup.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::routing::{
    ProxyError, RouteId, RouteStore, RoutingPolicy, StaticConfiguration, StaticProxySettings,
};
use crate::domain::service::{ServiceFamily, ServiceInstance, ServiceKey};

/// Counts of route files written by a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub instances: usize,
    pub families: usize,
}

pub struct ProxyConfigurator {
    store: Arc<dyn RouteStore>,
    policy: RoutingPolicy,
    manager_url: String,
    static_settings: StaticProxySettings,
}

impl ProxyConfigurator {
    pub fn new(
        store: Arc<dyn RouteStore>,
        policy: RoutingPolicy,
        manager_url: impl Into<String>,
        static_settings: StaticProxySettings,
    ) -> Self {
        Self {
            store,
            policy,
            manager_url: manager_url.into(),
            static_settings,
        }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub async fn write_instance_route(&self, instance: &ServiceInstance) -> Result<(), ProxyError> {
        let key = instance.key();
        debug!("Writing route for {}", key);
        self.store
            .write_route(&RouteId::instance(&key), &self.policy.instance_route(&key, &instance.url))
            .await
    }

    /// Writes the mirroring route of a family. Returns `false` without
    /// touching the store when the family has no main.
    pub async fn write_family_route(&self, family: &ServiceFamily) -> Result<bool, ProxyError> {
        match self.policy.family_route(family) {
            Some(config) => {
                debug!(
                    "Writing mirror route for {} (main {:?}, {} shadows)",
                    family.name,
                    family.main.as_ref().map(ToString::to_string),
                    family.shadows.len()
                );
                self.store.write_route(&RouteId::family(&family.name), &config).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn remove_instance_route(&self, key: &ServiceKey) -> Result<(), ProxyError> {
        self.store.remove_route(&RouteId::instance(key)).await
    }

    /// Rewrites the family route in place, or removes it once the family has
    /// no main. Returns whether a route remains.
    pub async fn sync_family_route(&self, family: &ServiceFamily) -> Result<bool, ProxyError> {
        if self.write_family_route(family).await? {
            return Ok(true);
        }
        debug!("Family {} has no main, removing its route", family.name);
        self.store.remove_route(&RouteId::family(&family.name)).await?;
        Ok(false)
    }

    /// Static proxy configuration plus the manager's own routes.
    pub async fn bootstrap(&self) -> Result<(), ProxyError> {
        info!("Writing proxy bootstrap configuration for {}", self.policy.domain);
        self.store
            .write_static(&StaticConfiguration::build(&self.static_settings))
            .await?;
        self.store
            .write_route(&RouteId::dashboard(), &self.policy.dashboard_route())
            .await?;
        self.store
            .write_route(&RouteId::manager(), &self.policy.manager_routes(&self.manager_url))
            .await?;
        self.store
            .write_route(
                &RouteId::auth_middleware(),
                &self.policy.auth_middleware(&self.manager_url),
            )
            .await
    }

    /// Rewrites every route derivable from `records`. Running it twice on the
    /// same records produces identical files.
    pub async fn replay(&self, records: &[ServiceInstance]) -> Result<ReplaySummary, ProxyError> {
        let mut summary = ReplaySummary::default();
        for record in records {
            self.write_instance_route(record).await?;
            summary.instances += 1;
        }

        let names: BTreeSet<_> = records.iter().map(|r| r.name.clone()).collect();
        for name in names {
            let family = ServiceFamily::from_instances(name, records);
            if self.write_family_route(&family).await? {
                summary.families += 1;
            }
        }

        info!(
            "Replayed {} instance routes and {} family routes",
            summary.instances, summary.families
        );
        Ok(summary)
    }
}
