// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! SQLite Service Repository
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Durable `ServiceRepository` backed by the `services` table
//!
//! `add` decides the main flag inside the INSERT itself, so concurrent adds
//! to the same family cannot both become main. The `(name, version)` primary
//! key turns a lost duplicate race into `RepositoryError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::domain::credentials::CredentialId;
use crate::domain::repository::{NewServiceRecord, RepositoryError, ServiceRepository};
use crate::domain::service::{ServiceInstance, ServiceKey, ServiceName, ServiceVersion};

const COLUMNS: &str = "name, version, image, url, main, credential_id, deployed_at";

pub struct SqliteServiceRepository {
    pool: SqlitePool,
}

impl SqliteServiceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceRepository for SqliteServiceRepository {
    async fn get(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM services WHERE name = ?1 AND version = ?2",
            COLUMNS
        ))
        .bind(key.name.as_str())
        .bind(key.version.to_string())
        .fetch_all(&self.pool)
        .await?;

        single(rows, || format!("service {}", key))
    }

    async fn get_main(&self, name: &ServiceName) -> Result<ServiceInstance, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM services WHERE name = ?1 AND main = 1",
            COLUMNS
        ))
        .bind(name.as_str())
        .fetch_all(&self.pool)
        .await?;

        single(rows, || format!("main version of {}", name))
    }

    async fn add(&self, record: NewServiceRecord) -> Result<ServiceInstance, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO services ({columns})
            VALUES (
                ?1, ?2, ?3, ?4,
                NOT EXISTS (SELECT 1 FROM services WHERE name = ?1 AND main = 1),
                ?5, ?6
            )
            RETURNING {columns}
            "#,
            columns = COLUMNS
        ))
        .bind(record.key.name.as_str())
        .bind(record.key.version.to_string())
        .bind(&record.image)
        .bind(&record.url)
        .bind(record.credential_id.0.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match RepositoryError::from(e) {
            RepositoryError::Conflict(_) => {
                RepositoryError::Conflict(format!("service {} is already recorded", record.key))
            }
            other => other,
        })?;

        parse_service_row(&row)
    }

    async fn delete(&self, key: &ServiceKey) -> Result<ServiceInstance, RepositoryError> {
        let row = sqlx::query(&format!(
            "DELETE FROM services WHERE name = ?1 AND version = ?2 RETURNING {}",
            COLUMNS
        ))
        .bind(key.name.as_str())
        .bind(key.version.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => parse_service_row(&row),
            None => Err(RepositoryError::NotFound(format!("service {}", key))),
        }
    }

    async fn assign_main(&self, key: &ServiceKey) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM services WHERE name = ?1 AND version = ?2",
        )
        .bind(key.name.as_str())
        .bind(key.version.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if exists == 0 {
            return Err(RepositoryError::NotFound(format!("service {}", key)));
        }

        let mains: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM services WHERE name = ?1 AND main = 1",
        )
        .bind(key.name.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if mains == 0 {
            return Err(RepositoryError::NotFound(format!("main version of {}", key.name)));
        }

        // Clear first so the single-main index never sees two mains
        sqlx::query("UPDATE services SET main = 0 WHERE name = ?1 AND version != ?2")
            .bind(key.name.as_str())
            .bind(key.version.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE services SET main = 1 WHERE name = ?1 AND version = ?2")
            .bind(key.name.as_str())
            .bind(key.version.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {} FROM services", COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        let mut services = rows
            .iter()
            .map(parse_service_row)
            .collect::<Result<Vec<_>, _>>()?;
        // Version order is semantic, not lexical
        services.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(services)
    }
}

fn single(
    rows: Vec<SqliteRow>,
    describe: impl FnOnce() -> String,
) -> Result<ServiceInstance, RepositoryError> {
    match rows.len() {
        0 => Err(RepositoryError::NotFound(describe())),
        1 => parse_service_row(&rows[0]),
        n => Err(RepositoryError::Conflict(format!(
            "{} matched {} records",
            describe(),
            n
        ))),
    }
}

fn parse_service_row(row: &SqliteRow) -> Result<ServiceInstance, RepositoryError> {
    let name: String = row.try_get("name")?;
    let version: String = row.try_get("version")?;
    let credential_id: String = row.try_get("credential_id")?;
    let deployed_at: DateTime<Utc> = row.try_get("deployed_at")?;

    Ok(ServiceInstance {
        name: ServiceName::parse(name)?,
        version: ServiceVersion::parse(&version)?,
        image: row.try_get("image")?,
        url: row.try_get("url")?,
        main: row.try_get("main")?,
        credential_id: CredentialId(
            Uuid::parse_str(&credential_id)
                .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        ),
        deployed_at,
    })
}
