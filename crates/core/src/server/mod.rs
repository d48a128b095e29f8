use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{OriginalUri, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod batch_routes;
mod error;
mod media_routes;
mod provider_routes;

pub use error::{AppError, ErrorResponse};

use crate::batch::{BatchStore, CaptionBackend, HttpCaptionBackend, QueueHandle, QueueWorker, WorkerSettings};
use crate::config::{AppConfig, FeatureFlags, ResolvedPaths};
use crate::providers::ProviderStore;

const SERVICE_NAME: &str = "graphcap";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: RwLock<AppConfig>,
    config_path: PathBuf,
    data_dir: PathBuf,
    paths: ResolvedPaths,
    batch: BatchStore,
    providers: ProviderStore,
    queue: QueueHandle,
    worker_settings: WorkerSettings,
}

impl AppState {
    /// Opens the stores under `data_dir`, creates the media directories and
    /// puts jobs interrupted by the previous shutdown back in the queue.
    pub fn new(config: AppConfig, config_path: PathBuf, data_dir: PathBuf) -> Result<Self> {
        let paths = config.paths.resolve(&data_dir);
        paths.create_all()?;

        let batch = BatchStore::new(&data_dir)?;
        let providers = ProviderStore::new(&data_dir)?;

        let requeued = batch.requeue_interrupted()?;
        if requeued > 0 {
            info!(
                requeued,
                db_path = %batch.db_path().display(),
                "Requeued batch jobs interrupted by the previous shutdown"
            );
        }

        Ok(Self {
            inner: Arc::new(AppStateInner {
                worker_settings: WorkerSettings::from(&config.queue),
                config: RwLock::new(config),
                config_path,
                data_dir,
                paths,
                batch,
                providers,
                queue: QueueHandle::new(),
            }),
        })
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.inner.data_dir
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.inner.paths
    }

    pub fn batch_store(&self) -> &BatchStore {
        &self.inner.batch
    }

    pub fn provider_store(&self) -> &ProviderStore {
        &self.inner.providers
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.inner.queue
    }

    pub async fn config(&self) -> AppConfig {
        self.inner.config.read().await.clone()
    }

    async fn features(&self) -> FeatureFlags {
        self.inner.config.read().await.features
    }

    /// Backend that forwards caption calls to the configured inference bridge.
    pub async fn http_caption_backend(&self) -> HttpCaptionBackend {
        let inference = self.inner.config.read().await.inference.clone();
        HttpCaptionBackend::new(self.inner.providers.clone(), inference)
    }

    /// Starts the queue worker; it stops when `shutdown` fires.
    pub fn spawn_queue_worker(
        &self,
        backend: Arc<dyn CaptionBackend>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        QueueWorker::new(
            self.inner.batch.clone(),
            backend,
            self.inner.worker_settings.clone(),
            self.inner.queue.clone(),
            self.inner.paths.workspace.clone(),
        )
        .spawn(shutdown)
    }
}

/// Runs a store or filesystem operation on the blocking pool.
pub(crate) async fn run_blocking<T, E, F>(op: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<AppError> + Send + 'static,
{
    tokio::task::spawn_blocking(op).await?.map_err(Into::into)
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/db", get(health_db))
        .route(
            "/api/feature-flags",
            get(get_feature_flags).put(update_feature_flags),
        )
        .merge(batch_routes::routes())
        .merge(provider_routes::routes())
        .merge(media_routes::routes())
        .fallback(route_not_found)
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "HTTP request"
    );
    response
}

async fn route_not_found(method: Method, OriginalUri(uri): OriginalUri) -> AppError {
    AppError::NotFound(format!("Route not found: {method} {}", uri.path()))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

#[derive(Serialize)]
struct DbHealthResponse {
    status: &'static str,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn health_db(State(state): State<AppState>) -> Response {
    let store = state.inner.batch.clone();
    let ping = tokio::task::spawn_blocking(move || store.ping())
        .await
        .map_err(anyhow::Error::from)
        .and_then(|result| result);

    match ping {
        Ok(()) => Json(DbHealthResponse {
            status: "ok",
            database: "connected",
            error: None,
        })
        .into_response(),
        Err(err) => {
            warn!(error = ?err, "Database health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(DbHealthResponse {
                    status: "error",
                    database: "error",
                    error: Some(format!("{err:#}")),
                }),
            )
                .into_response()
        }
    }
}

async fn get_feature_flags(State(state): State<AppState>) -> Json<FeatureFlags> {
    Json(state.features().await)
}

async fn update_feature_flags(
    State(state): State<AppState>,
    payload: Result<Json<FeatureFlags>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<FeatureFlags>, AppError> {
    let Json(flags) = payload?;

    let mut config = state.inner.config.write().await;
    let mut updated = config.clone();
    updated.features = flags;
    updated.save_to_path(&state.inner.config_path)?;
    *config = updated;
    info!(
        batch_queue = flags.batch_queue,
        webp_cache = flags.webp_cache,
        image_editing = flags.image_editing,
        "Feature flags updated"
    );

    Ok(Json(flags))
}
