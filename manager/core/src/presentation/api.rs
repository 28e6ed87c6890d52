// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP API of the manager.
//!
//! Every route is registered in [`app`]. Handlers translate requests into
//! [`ServiceLifecycleService`] calls and map [`LifecycleError`] onto status
//! codes; no handler touches the runtime, store or proxy directly.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info};

use crate::application::lifecycle::{
    DeployRequest, LifecycleError, ServiceLifecycleService, SourceDescriptor,
};
use crate::domain::runtime::{LogOptions, RunOptions, DEFAULT_INTERNAL_PORT};
use crate::domain::service::{ServiceInstance, ServiceKey};
use crate::infrastructure::builder::unpack_source_archive;
use crate::infrastructure::event_bus::EventBus;

/// Largest accepted upload (image archives, source tarballs)
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<dyn ServiceLifecycleService>,
    pub event_bus: Arc<EventBus>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(lifecycle: Arc<dyn ServiceLifecycleService>, event_bus: Arc<EventBus>) -> Self {
        Self {
            lifecycle,
            event_bus,
            started_at: Instant::now(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/~version", get(version_handler))
        .route("/services", get(list_services_handler).delete(kill_service_handler))
        .route("/services/~image", post(deploy_image_handler))
        .route("/services/~git", post(deploy_git_handler))
        .route("/services/~tar", post(deploy_tar_handler))
        .route("/services/~upload-image", post(upload_image_handler))
        .route("/services/~assign", put(assign_main_handler))
        .route("/services/~logs", get(logs_handler))
        .route("/services/~inspection", get(inspect_handler))
        .route("/events", get(stream_events_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(Arc::new(state))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn unprocessable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::Conflict(_) => StatusCode::CONFLICT,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::Forbidden(_) => StatusCode::FORBIDDEN,
            LifecycleError::OutOfSync(_) => StatusCode::PRECONDITION_FAILED,
            LifecycleError::Build(_) | LifecycleError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LifecycleError::Substrate(_) | LifecycleError::Internal(_) => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request and response bodies
// ============================================================================

fn default_port() -> u16 {
    DEFAULT_INTERNAL_PORT
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ServiceRef {
    pub name: String,
    pub version: String,
}

impl ServiceRef {
    fn key(&self) -> ApiResult<ServiceKey> {
        ServiceKey::parse(&self.name, &self.version)
            .map_err(|e| ApiError::from(LifecycleError::from(e)))
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageDeployBody {
    pub name: String,
    pub version: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub image: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub run_args: RunOptions,
}

#[derive(Debug, Deserialize)]
pub struct GitDeployBody {
    pub name: String,
    pub version: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub git_url: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct KillQuery {
    #[serde(default = "default_true")]
    pub remove_image: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub name: String,
    pub version: String,
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ServiceResponse {
    pub name: String,
    pub version: String,
    pub image: String,
    pub url: String,
    pub main: bool,
    pub deployed_at: DateTime<Utc>,
}

impl From<ServiceInstance> for ServiceResponse {
    fn from(instance: ServiceInstance) -> Self {
        Self {
            name: instance.name.to_string(),
            version: instance.version.to_string(),
            image: instance.image,
            url: instance.url,
            main: instance.main,
            deployed_at: instance.deployed_at,
        }
    }
}

fn validated_port(port: u16) -> ApiResult<u16> {
    if port == 0 {
        return Err(ApiError::unprocessable("port must be greater than 0"));
    }
    Ok(port)
}

async fn deploy(state: &AppState, request: DeployRequest) -> ApiResult<(StatusCode, Json<&'static str>)> {
    state.lifecycle.deploy(request).await?;
    Ok((StatusCode::ACCEPTED, Json("Accepted")))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn version_handler() -> Json<&'static str> {
    Json(env!("CARGO_PKG_VERSION"))
}

async fn list_services_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ServiceResponse>>> {
    state.lifecycle.check_consistency().await?;
    let services = state.lifecycle.list().await?;
    Ok(Json(services.into_iter().map(ServiceResponse::from).collect()))
}

async fn deploy_image_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImageDeployBody>,
) -> ApiResult<(StatusCode, Json<&'static str>)> {
    let key = ServiceRef {
        name: body.name,
        version: body.version,
    }
    .key()?;
    let request = DeployRequest {
        key,
        port: validated_port(body.port)?,
        env: body.environment,
        source: SourceDescriptor::Image {
            image: body.image,
            run_options: body.run_args,
        },
    };
    deploy(&state, request).await
}

async fn deploy_git_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GitDeployBody>,
) -> ApiResult<(StatusCode, Json<&'static str>)> {
    let key = ServiceRef {
        name: body.name,
        version: body.version,
    }
    .key()?;
    if !(body.git_url.starts_with("http://") || body.git_url.starts_with("https://")) {
        return Err(ApiError::unprocessable("git_url must be an http(s) URL"));
    }
    let request = DeployRequest {
        key,
        port: validated_port(body.port)?,
        env: body.environment,
        source: SourceDescriptor::Git { url: body.git_url },
    };
    deploy(&state, request).await
}

/// Multipart form with `name`, `version`, optional `port` and a `file`
/// holding a (gzipped) tarball of the service source.
async fn deploy_tar_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<&'static str>)> {
    let mut name = None;
    let mut version = None;
    let mut port = DEFAULT_INTERNAL_PORT;
    let mut archive = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::unprocessable(e.to_string()))?
    {
        let field_name = field.name().map(str::to_string);
        let read_err = |e: axum::extract::multipart::MultipartError| ApiError::unprocessable(e.to_string());
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await.map_err(read_err)?),
            Some("version") => version = Some(field.text().await.map_err(read_err)?),
            Some("port") => {
                let text = field.text().await.map_err(read_err)?;
                port = text
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::unprocessable(format!("invalid port '{}'", text)))?;
            }
            Some("file") => archive = Some(field.bytes().await.map_err(read_err)?),
            _ => {}
        }
    }

    let (Some(name), Some(version), Some(archive)) = (name, version, archive) else {
        return Err(ApiError::unprocessable("name, version and file are required"));
    };
    let key = ServiceRef { name, version }.key()?;
    let port = validated_port(port)?;

    let workdir = tempfile::Builder::new()
        .prefix("skiff_")
        .tempdir()
        .map_err(|e| ApiError::from(LifecycleError::Internal(e.to_string())))?;
    let source_dir = workdir.path().to_path_buf();

    let unpack_dir = source_dir.clone();
    tokio::task::spawn_blocking(move || unpack_source_archive(&archive, &unpack_dir))
        .await
        .map_err(|e| ApiError::from(LifecycleError::Internal(e.to_string())))?
        .map_err(|e| ApiError::from(LifecycleError::from(e)))?;

    let request = DeployRequest {
        key,
        port,
        env: BTreeMap::new(),
        source: SourceDescriptor::Source { path: source_dir },
    };
    // workdir is removed when dropped, after the build has finished
    let result = deploy(&state, request).await;
    drop(workdir);
    result
}

async fn upload_image_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::unprocessable(e.to_string()))?
    {
        if field.name() == Some("image") {
            let archive = field
                .bytes()
                .await
                .map_err(|e| ApiError::unprocessable(e.to_string()))?;
            let tags = state.lifecycle.load_image(archive).await?;
            info!("Image uploaded with tags {:?}", tags);
            return Ok((StatusCode::ACCEPTED, Json(json!({ "tags": tags }))));
        }
    }
    Err(ApiError::unprocessable("multipart field 'image' is required"))
}

async fn kill_service_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KillQuery>,
    Json(service): Json<ServiceRef>,
) -> ApiResult<Json<&'static str>> {
    let key = service.key()?;
    state.lifecycle.kill(&key, query.remove_image).await?;
    Ok(Json("OK"))
}

async fn assign_main_handler(
    State(state): State<Arc<AppState>>,
    Json(service): Json<ServiceRef>,
) -> ApiResult<Json<&'static str>> {
    let key = service.key()?;
    state.lifecycle.assign_main(&key).await?;
    Ok(Json("OK"))
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let key = ServiceRef {
        name: query.name,
        version: query.version,
    }
    .key()?;
    let options = LogOptions {
        tail: query.tail,
        follow: query.follow,
        since: query.since,
    };
    let stream = state.lifecycle.logs(&key, options).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            // Browsers render the stream immediately instead of buffering it
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn inspect_handler(
    State(state): State<Arc<AppState>>,
    Query(service): Query<ServiceRef>,
) -> ApiResult<Json<crate::domain::runtime::RuntimeState>> {
    let key = service.key()?;
    Ok(Json(state.lifecycle.inspect(&key).await?))
}

async fn stream_events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Lagged receivers skip what they missed
    let stream = BroadcastStream::new(state.event_bus.subscribe_raw())
        .filter_map(|item| item.ok())
        .filter_map(|event| Event::default().json_data(&event).ok())
        .map(Ok);

    Sse::new(stream).keep_alive(KeepAlive::default())
}
