// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Proxy route stores
//!
//! `FileRouteStore` renders configuration as TOML into the directory watched
//! by the proxy's file provider. Each write lands in a hidden temporary file
//! first and is renamed into place, so the proxy never loads a half-written
//! document. `InMemoryRouteStore` keeps the rendered text in a map and is used
//! where no proxy is running.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::routing::{
    DynamicConfiguration, ProxyError, RouteId, RouteStore, StaticConfiguration,
};

pub const STATIC_CONFIG_FILE: &str = "traefik.toml";

pub struct FileRouteStore {
    static_dir: PathBuf,
    dynamic_dir: PathBuf,
}

impl FileRouteStore {
    pub fn new(static_dir: impl Into<PathBuf>, dynamic_dir: impl Into<PathBuf>) -> Self {
        Self {
            static_dir: static_dir.into(),
            dynamic_dir: dynamic_dir.into(),
        }
    }

    pub fn route_path(&self, id: &RouteId) -> PathBuf {
        self.dynamic_dir.join(id.file_name())
    }

    pub fn static_path(&self) -> PathBuf {
        self.static_dir.join(STATIC_CONFIG_FILE)
    }

    async fn write_atomic(path: &Path, content: &str) -> Result<(), ProxyError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // One temp file per write; concurrent writers of a route never share it
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl RouteStore for FileRouteStore {
    async fn write_route(&self, id: &RouteId, config: &DynamicConfiguration) -> Result<(), ProxyError> {
        let path = self.route_path(id);
        let content = toml::to_string(config)?;
        debug!("Writing proxy configuration {:?}", path);
        Self::write_atomic(&path, &content).await
    }

    async fn remove_route(&self, id: &RouteId) -> Result<(), ProxyError> {
        let path = self.route_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted proxy configuration {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_static(&self, config: &StaticConfiguration) -> Result<(), ProxyError> {
        tokio::fs::create_dir_all(&self.dynamic_dir).await?;
        let path = self.static_path();
        let content = toml::to_string(config)?;
        info!("Writing static proxy configuration {:?}", path);
        Self::write_atomic(&path, &content).await
    }
}

/// Route store that keeps rendered documents in memory, keyed by file name.
#[derive(Clone, Default)]
pub struct InMemoryRouteStore {
    routes: Arc<RwLock<BTreeMap<String, String>>>,
    static_config: Arc<RwLock<Option<String>>>,
}

impl InMemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &RouteId) -> Option<String> {
        self.routes.read().await.get(&id.file_name()).cloned()
    }

    pub async fn file_names(&self) -> Vec<String> {
        self.routes.read().await.keys().cloned().collect()
    }

    pub async fn static_config(&self) -> Option<String> {
        self.static_config.read().await.clone()
    }
}

#[async_trait]
impl RouteStore for InMemoryRouteStore {
    async fn write_route(&self, id: &RouteId, config: &DynamicConfiguration) -> Result<(), ProxyError> {
        let content = toml::to_string(config)?;
        self.routes.write().await.insert(id.file_name(), content);
        Ok(())
    }

    async fn remove_route(&self, id: &RouteId) -> Result<(), ProxyError> {
        self.routes.write().await.remove(&id.file_name());
        Ok(())
    }

    async fn write_static(&self, config: &StaticConfiguration) -> Result<(), ProxyError> {
        let content = toml::to_string(config)?;
        *self.static_config.write().await = Some(content);
        Ok(())
    }
}
