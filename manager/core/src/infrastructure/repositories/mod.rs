// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the `ServiceRepository` contract defined
//! in the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve deployed service records
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **SqliteServiceRepository** - durable storage, one statement or
//!   transaction per operation
//! - **InMemoryServiceRepository** - `BTreeMap` behind an async lock, every
//!   operation holds the lock for its whole duration
//!
//! Both order records by name and then by semantic version.

pub mod sqlite_service;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::repository::{NewServiceRecord, RepositoryError, ServiceRepository};
use crate::domain::service::{ServiceInstance, ServiceKey, ServiceName};

pub use sqlite_service::SqliteServiceRepository;

#[derive(Clone, Default)]
pub struct InMemoryServiceRepository {
    records: Arc<RwLock<BTreeMap<ServiceKey, ServiceInstance>>>,
}

impl InMemoryServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRepository for InMemoryServiceRepository {
    async fn get(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
        let records = self.records.read().await;
        records
            .get(key)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("service {}", key)))
    }

    async fn get_main(&self, name: &ServiceName) -> Result<ServiceInstance, RepositoryError> {
        let records = self.records.read().await;
        let mut mains = records.values().filter(|r| &r.name == name && r.main);
        match (mains.next(), mains.next()) {
            (Some(main), None) => Ok(main.clone()),
            (None, _) => Err(RepositoryError::NotFound(format!("main version of {}", name))),
            (Some(_), Some(_)) => Err(RepositoryError::Conflict(format!(
                "multiple main versions recorded for {}",
                name
            ))),
        }
    }

    async fn add(&self, record: NewServiceRecord) -> Result<ServiceInstance, RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.key) {
            return Err(RepositoryError::Conflict(format!(
                "service {} is already recorded",
                record.key
            )));
        }

        let has_main = records
            .values()
            .any(|r| r.name == record.key.name && r.main);
        let instance = ServiceInstance {
            name: record.key.name.clone(),
            version: record.key.version.clone(),
            image: record.image,
            url: record.url,
            main: !has_main,
            credential_id: record.credential_id,
            deployed_at: Utc::now(),
        };
        records.insert(record.key, instance.clone());
        Ok(instance)
    }

    async fn delete(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
        let mut records = self.records.write().await;
        records
            .remove(key)
            .ok_or_else(|| RepositoryError::NotFound(format!("service {}", key)))
    }

    async fn assign_main(&self, key: &ServiceKey) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if !records.contains_key(key) {
            return Err(RepositoryError::NotFound(format!("service {}", key)));
        }
        if !records.values().any(|r| r.name == key.name && r.main) {
            return Err(RepositoryError::NotFound(format!("main version of {}", key.name)));
        }

        for record in records.values_mut().filter(|r| r.name == key.name) {
            record.main = record.version == key.version;
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credentials::CredentialId;
    use crate::domain::service::ContainerNaming;

    fn new_record(name: &str, version: &str) -> NewServiceRecord {
        NewServiceRecord {
            key: ServiceKey::parse(name, version).unwrap(),
            image: format!("{}:{}", name, version),
            url: "http://localhost:8001".to_string(),
            credential_id: CredentialId::new(),
        }
    }

    #[tokio::test]
    async fn test_first_record_becomes_main() {
        let repo = InMemoryServiceRepository::new();
        let first = repo.add(new_record("svc", "1.0.0")).await.expect("add first");
        let second = repo.add(new_record("svc", "1.1.0")).await.expect("add second");
        let other = repo.add(new_record("other", "0.1.0")).await.expect("add other");

        assert!(first.main);
        assert!(!second.main);
        assert!(other.main);

        let main = repo.get_main(&first.name).await.expect("main");
        assert_eq!(main.version, first.version);
    }

    #[tokio::test]
    async fn test_duplicate_add_conflicts_and_keeps_original() {
        let repo = InMemoryServiceRepository::new();
        let original = repo.add(new_record("svc", "1.0.0")).await.unwrap();

        let mut duplicate = new_record("svc", "1.0.0");
        duplicate.url = "http://elsewhere:9999".to_string();
        let err = repo.add(duplicate).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let stored = repo.get(&original.key()).await.unwrap();
        assert_eq!(stored, original);
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_assign_main_roundtrip() {
        let repo = InMemoryServiceRepository::new();
        let v1 = repo.add(new_record("svc", "1.0.0")).await.unwrap();
        let v2 = repo.add(new_record("svc", "2.0.0")).await.unwrap();

        repo.assign_main(&v2.key()).await.unwrap();
        let family = repo.family(&v1.name).await.unwrap();
        assert_eq!(family.main, Some(v2.version.clone()));
        assert_eq!(family.shadows, vec![v1.version.clone()]);

        // Idempotent on the current main
        repo.assign_main(&v2.key()).await.unwrap();
        repo.assign_main(&v1.key()).await.unwrap();
        let family = repo.family(&v1.name).await.unwrap();
        assert_eq!(family.main, Some(v1.version));
        assert_eq!(family.shadows, vec![v2.version]);
    }

    #[tokio::test]
    async fn test_assign_main_unknown_version() {
        let repo = InMemoryServiceRepository::new();
        repo.add(new_record("svc", "1.0.0")).await.unwrap();
        let missing = ServiceKey::parse("svc", "9.9.9").unwrap();
        assert!(matches!(
            repo.assign_main(&missing).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_returns_removed_record() {
        let repo = InMemoryServiceRepository::new();
        let added = repo.add(new_record("svc", "1.0.0")).await.unwrap();
        let removed = repo.delete(&added.key()).await.unwrap();
        assert_eq!(removed, added);
        assert!(matches!(
            repo.delete(&added.key()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_orders_by_semver() {
        let repo = InMemoryServiceRepository::new();
        for version in ["1.10.0", "1.2.0", "1.2.0-rc.1"] {
            repo.add(new_record("svc", version)).await.unwrap();
        }
        let versions: Vec<String> = repo
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1.2.0-rc.1", "1.2.0", "1.10.0"]);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_adds_yield_one_conflict() {
        let repo = InMemoryServiceRepository::new();
        let a = repo.clone();
        let b = repo.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.add(new_record("svc", "1.0.0")).await }),
            tokio::spawn(async move { b.add(new_record("svc", "1.0.0")).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(RepositoryError::Conflict(_))))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_reconcile_reports_drift() {
        let repo = InMemoryServiceRepository::new();
        repo.add(new_record("svc", "1.0.0")).await.unwrap();
        let naming = ContainerNaming::default();

        repo.reconcile(&naming, &["skiff-svc-1.0.0".to_string()])
            .await
            .expect("in sync");

        let err = repo
            .reconcile(&naming, &["skiff-ghost-1.0.0".to_string()])
            .await
            .unwrap_err();
        match err {
            RepositoryError::OutOfSync(report) => {
                assert_eq!(report.extra, vec!["skiff-ghost-1.0.0".to_string()]);
                assert_eq!(report.missing, vec!["skiff-svc-1.0.0".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
