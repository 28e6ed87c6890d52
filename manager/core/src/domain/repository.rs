// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Record Store
//!
//! Persistence contract for deployed service instances, following the DDD
//! Repository pattern: interface defined here, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | `InMemoryServiceRepository` | `BTreeMap` behind a lock (tests, ephemeral managers) |
//! | `SqliteServiceRepository` | SQLite via `sqlx` |
//!
//! ## Invariants
//!
//! - At most one record per family has `main = true`, and a non-empty family
//!   always has one. The first record added to a family becomes its main.
//! - `(name, version)` is unique. A duplicate `add` fails with
//!   [`RepositoryError::Conflict`] and leaves the store untouched.
//!
//! The store never heals drift against the runtime. [`ServiceRepository::reconcile`]
//! only reports it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::domain::credentials::CredentialId;
use crate::domain::service::{
    ContainerNaming, ServiceFamily, ServiceInstance, ServiceKey, ServiceName,
};

/// Input to [`ServiceRepository::add`]. The store decides `main`.
#[derive(Debug, Clone)]
pub struct NewServiceRecord {
    pub key: ServiceKey,
    pub image: String,
    pub url: String,
    pub credential_id: CredentialId,
}

/// Difference between recorded instances and runtime containers, both
/// expressed as container names and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Running in the runtime but not recorded.
    pub extra: Vec<String>,
    /// Recorded but not present in the runtime.
    pub missing: Vec<String>,
}

impl SyncReport {
    pub fn compare(
        naming: &ContainerNaming,
        records: &[ServiceInstance],
        running: &[String],
    ) -> Self {
        let recorded: BTreeSet<String> = records
            .iter()
            .map(|r| naming.container_name(&r.key()))
            .collect();
        // Docker reports names with a leading slash
        let running: BTreeSet<String> = running
            .iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();

        Self {
            extra: running.difference(&recorded).cloned().collect(),
            missing: recorded.difference(&running).cloned().collect(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.extra.is_empty() && self.missing.is_empty()
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if !self.extra.is_empty() {
            parts.push(format!(
                "services in runtime but not recorded: {}",
                self.extra.join(", ")
            ));
        }
        if !self.missing.is_empty() {
            parts.push(format!(
                "services recorded but not in runtime: {}",
                self.missing.join(", ")
            ));
        }
        f.write_str(&parts.join("; "))
    }
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Fetch one record. `Conflict` if the store somehow holds duplicates.
    async fn get(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError>;

    /// Fetch the main record of a family.
    async fn get_main(&self, name: &ServiceName) -> Result<ServiceInstance, RepositoryError>;

    /// Insert a record. It becomes main iff its family has no main yet.
    async fn add(&self, record: NewServiceRecord) -> Result<ServiceInstance, RepositoryError>;

    /// Remove a record and return what was removed.
    async fn delete(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError>;

    /// Move the main flag of `key.name` to `key.version`. Idempotent when the
    /// version already is main. `NotFound` if the version does not exist or
    /// the family has no main.
    async fn assign_main(&self, key: &ServiceKey) -> Result<(), RepositoryError>;

    /// All records ordered by name, then version.
    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError>;

    async fn family(&self, name: &ServiceName) -> Result<ServiceFamily, RepositoryError> {
        let records = self.list_all().await?;
        Ok(ServiceFamily::from_instances(name.clone(), &records))
    }

    /// Compare the store against the container names reported by the
    /// runtime. Fails with `OutOfSync` on any difference.
    async fn reconcile(
        &self,
        naming: &ContainerNaming,
        running: &[String],
    ) -> Result<(), RepositoryError> {
        let records = self.list_all().await?;
        let report = SyncReport::compare(naming, &records, running);
        if report.is_consistent() {
            Ok(())
        } else {
            Err(RepositoryError::OutOfSync(report))
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Record store out of sync with runtime: {0}")]
    OutOfSync(SyncReport),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::Conflict(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<crate::domain::service::ValidationError> for RepositoryError {
    fn from(err: crate::domain::service::ValidationError) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
