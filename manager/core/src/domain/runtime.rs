// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::service::ServiceKey;

pub const DEFAULT_INTERNAL_PORT: u16 = 8000;

/// Extra container settings supplied with an image deploy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Overrides the image's default command
    pub command: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    /// `host_path:container_path[:mode]`
    pub binds: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub cpu_millis: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CreateInstanceSpec {
    pub key: ServiceKey,
    pub image: String,
    pub internal_port: u16,
    /// Caller environment. Manager-provided variables take precedence.
    pub env: BTreeMap<String, String>,
    pub run_options: RunOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
    pub since: Option<DateTime<Utc>>,
}

/// Point-in-time view of one runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub container_name: String,
    pub status: String,
    pub running: bool,
    pub image: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub exit_code: Option<i64>,
    pub restart_count: Option<i64>,
    pub ip_address: Option<String>,
    /// Raw inspect document from the runtime
    pub detail: serde_json::Value,
}

pub type LogStream = BoxStream<'static, Result<Bytes, RuntimeError>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Image not found: {0}")]
    ImageNotFound(String),
    /// Container name already taken, usually by a concurrent deploy
    #[error("Instance already exists: {0}")]
    Conflict(String),
    #[error("Port is already allocated: {0}")]
    PortAllocated(String),
    #[error("Container runtime error: {0}")]
    Substrate(String),
}

/// Contract for the container runtime hosting service instances.
///
/// Instances are addressed by [`ServiceKey`]; implementations derive their
/// own container names from it.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Names of every service container, running or stopped.
    async fn list_instances(&self) -> Result<Vec<String>, RuntimeError>;

    async fn exists(&self, key: &ServiceKey) -> Result<bool, RuntimeError>;

    /// Whether any service container runs the image `{name}:{version}`.
    async fn image_in_use(&self, key: &ServiceKey) -> Result<bool, RuntimeError>;

    /// Create and start an instance. Returns the URL the proxy should route to.
    async fn create(&self, spec: CreateInstanceSpec) -> Result<String, RuntimeError>;

    /// Forced removal. Removing an absent instance succeeds.
    async fn remove(&self, key: &ServiceKey) -> Result<(), RuntimeError>;

    /// Best-effort removal of the image `{name}:{version}`. Never fails.
    async fn remove_image(&self, key: &ServiceKey);

    async fn inspect(&self, key: &ServiceKey) -> Result<RuntimeState, RuntimeError>;

    /// Finite when `follow` is false. Dropping the stream stops reading.
    async fn logs(&self, key: &ServiceKey, options: LogOptions) -> Result<LogStream, RuntimeError>;
}
