// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Record store contract, run against both implementations.

use skiff_manager_core::domain::credentials::CredentialId;
use skiff_manager_core::domain::repository::{NewServiceRecord, RepositoryError, ServiceRepository};
use skiff_manager_core::domain::service::{ContainerNaming, ServiceKey, ServiceName};
use skiff_manager_core::infrastructure::db::Database;
use skiff_manager_core::infrastructure::repositories::{
    InMemoryServiceRepository, SqliteServiceRepository,
};
use std::sync::Arc;

fn record(name: &str, version: &str) -> NewServiceRecord {
    NewServiceRecord {
        key: ServiceKey::parse(name, version).unwrap(),
        image: format!("{}:{}", name, version),
        url: format!("http://localhost:80{}", version.replace('.', "")),
        credential_id: CredentialId::new(),
    }
}

async fn stores() -> Vec<(&'static str, Arc<dyn ServiceRepository>)> {
    let db = Database::in_memory().await.expect("in-memory sqlite");
    vec![
        ("memory", Arc::new(InMemoryServiceRepository::new())),
        ("sqlite", Arc::new(SqliteServiceRepository::new(db.get_pool().clone()))),
    ]
}

#[tokio::test]
async fn test_first_record_of_family_is_main() {
    for (label, store) in stores().await {
        let first = store.add(record("svc", "1.0.0")).await.unwrap();
        let second = store.add(record("svc", "1.1.0")).await.unwrap();
        let other = store.add(record("other", "0.1.0")).await.unwrap();

        assert!(first.main, "{}", label);
        assert!(!second.main, "{}", label);
        assert!(other.main, "{}", label);

        let name = ServiceName::parse("svc").unwrap();
        assert_eq!(store.get_main(&name).await.unwrap().version.to_string(), "1.0.0", "{}", label);
    }
}

#[tokio::test]
async fn test_duplicate_add_conflicts_and_leaves_store_unchanged() {
    for (label, store) in stores().await {
        let original = store.add(record("svc", "1.0.0")).await.unwrap();

        let mut duplicate = record("svc", "1.0.0");
        duplicate.url = "http://localhost:9999".to_string();
        let result = store.add(duplicate).await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))), "{}", label);

        let stored = store.get(&original.key()).await.unwrap();
        assert_eq!(stored.url, original.url, "{}", label);
        assert_eq!(store.list_all().await.unwrap().len(), 1, "{}", label);
    }
}

#[tokio::test]
async fn test_concurrent_adds_of_one_key_yield_one_conflict() {
    for (label, store) in stores().await {
        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            async move { a.add(record("svc", "1.0.0")).await },
            async move { b.add(record("svc", "1.0.0")).await },
        );

        let conflicts = [&ra, &rb]
            .iter()
            .filter(|r| matches!(r, Err(RepositoryError::Conflict(_))))
            .count();
        assert_eq!(conflicts, 1, "{}", label);
        assert!(ra.is_ok() || rb.is_ok(), "{}", label);
    }
}

#[tokio::test]
async fn test_assign_main_moves_flag() {
    for (label, store) in stores().await {
        store.add(record("svc", "1.0.0")).await.unwrap();
        store.add(record("svc", "1.1.0")).await.unwrap();
        let name = ServiceName::parse("svc").unwrap();

        let target = ServiceKey::parse("svc", "1.1.0").unwrap();
        store.assign_main(&target).await.unwrap();
        store.assign_main(&target).await.unwrap();

        let family = store.family(&name).await.unwrap();
        assert_eq!(family.main.unwrap().to_string(), "1.1.0", "{}", label);
        assert_eq!(family.shadows.len(), 1, "{}", label);

        let missing = ServiceKey::parse("svc", "2.0.0").unwrap();
        assert!(
            matches!(store.assign_main(&missing).await, Err(RepositoryError::NotFound(_))),
            "{}",
            label
        );
    }
}

#[tokio::test]
async fn test_delete_returns_record_and_missing_is_not_found() {
    for (label, store) in stores().await {
        let added = store.add(record("svc", "1.0.0")).await.unwrap();
        let removed = store.delete(&added.key()).await.unwrap();
        assert_eq!(removed.credential_id, added.credential_id, "{}", label);

        assert!(
            matches!(store.delete(&added.key()).await, Err(RepositoryError::NotFound(_))),
            "{}",
            label
        );
        let name = ServiceName::parse("svc").unwrap();
        assert!(
            matches!(store.get_main(&name).await, Err(RepositoryError::NotFound(_))),
            "{}",
            label
        );
    }
}

#[tokio::test]
async fn test_list_orders_versions_semantically() {
    for (label, store) in stores().await {
        for version in ["1.10.0", "1.2.0", "1.2.0-rc.1"] {
            store.add(record("svc", version)).await.unwrap();
        }
        store.add(record("alpha", "0.1.0")).await.unwrap();

        let listed: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.key().to_string())
            .collect();
        assert_eq!(
            listed,
            vec!["alpha 0.1.0", "svc 1.2.0-rc.1", "svc 1.2.0", "svc 1.10.0"],
            "{}",
            label
        );
    }
}

#[tokio::test]
async fn test_reconcile_reports_both_directions() {
    let naming = ContainerNaming::default();
    for (label, store) in stores().await {
        store.add(record("svc", "1.0.0")).await.unwrap();
        store.add(record("svc", "1.1.0")).await.unwrap();

        store
            .reconcile(&naming, &["/skiff-svc-1.0.0".to_string(), "/skiff-svc-1.1.0".to_string()])
            .await
            .unwrap();

        match store
            .reconcile(&naming, &["/skiff-svc-1.0.0".to_string(), "/skiff-stray-2.0.0".to_string()])
            .await
        {
            Err(RepositoryError::OutOfSync(report)) => {
                assert_eq!(report.extra, vec!["skiff-stray-2.0.0"], "{}", label);
                assert_eq!(report.missing, vec!["skiff-svc-1.1.0"], "{}", label);
            }
            other => panic!("{}: unexpected result {:?}", label, other),
        }
        // Reconcile never heals
        assert_eq!(store.list_all().await.unwrap().len(), 2, "{}", label);
    }
}

#[tokio::test]
async fn test_sqlite_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("skiff.db").display());

    {
        let db = Database::new(&url).await.unwrap();
        let store = SqliteServiceRepository::new(db.get_pool().clone());
        store.add(record("svc", "1.0.0")).await.unwrap();
        db.get_pool().close().await;
    }

    let db = Database::new(&url).await.unwrap();
    let store = SqliteServiceRepository::new(db.get_pool().clone());
    let records = store.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].main);
}
