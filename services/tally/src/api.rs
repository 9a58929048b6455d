use crate::clock::Calendar;
use crate::config::ApiConfig;
use crate::daily_store::{DailyRecord, DailyRecordStore};
use crate::error::ApiError;
use crate::image_cache::{ImageMeta, ImageSlotCache};
use crate::queries::{TallyQueries, Totals};
use crate::reconciler::Reconciler;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub queries: Arc<TallyQueries>,
    pub images: Arc<ImageSlotCache>,
    pub store: Arc<dyn DailyRecordStore>,
    pub service_name: String,
}

impl AppState {
    /// Wire the reconciler and query views over one store and calendar
    pub fn new(
        store: Arc<dyn DailyRecordStore>,
        calendar: Calendar,
        images: Arc<ImageSlotCache>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler::new(store.clone(), calendar.clone())),
            queries: Arc::new(TallyQueries::new(store.clone(), calendar)),
            images,
            store,
            service_name: service_name.into(),
        }
    }
}

/// Counts reported by one detection event
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub fresh: u64,
    pub rotten: u64,
}

/// Single-label detection event
#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    #[serde(rename = "type")]
    pub label: Label,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Fresh,
    Rotten,
}

/// Ingestion acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// The counts were accepted
    pub success: bool,
    /// The counts are already part of today's record
    pub persisted: bool,
}

/// Query parameters for history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_days")]
    pub days: u32,
}

fn default_history_days() -> u32 {
    7
}

/// History as parallel arrays aligned by index
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryResponse {
    pub dates: Vec<String>,
    pub fresh_counts: Vec<i64>,
    pub rotten_counts: Vec<i64>,
}

impl From<Vec<DailyRecord>> for HistoryResponse {
    fn from(records: Vec<DailyRecord>) -> Self {
        let mut response = Self {
            dates: Vec::with_capacity(records.len()),
            fresh_counts: Vec::with_capacity(records.len()),
            rotten_counts: Vec::with_capacity(records.len()),
        };
        for record in records {
            response.dates.push(record.date.format("%Y-%m-%d").to_string());
            response.fresh_counts.push(record.fresh_count);
            response.rotten_counts.push(record.rotten_count);
        }
        response
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ingest", post(ingest))
        .route("/ingest/label", post(ingest_label))
        .route("/count", get(today_count))
        .route("/history", get(history))
        .route("/upload-image", post(upload_image))
        .route("/latest-image", get(latest_image))
        .route("/latest-image/meta", get(latest_image_meta))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a detection event with explicit counts
#[instrument(skip(state, payload))]
async fn ingest(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(request) = payload?;
    let receipt = state.reconciler.ingest(request.fresh, request.rotten).await?;

    Ok(Json(IngestResponse {
        success: true,
        persisted: receipt.persisted(),
    }))
}

/// Accept a detection event carrying a single label
#[instrument(skip(state, payload))]
async fn ingest_label(
    State(state): State<AppState>,
    payload: Result<Json<LabelRequest>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(request) = payload?;
    let (fresh, rotten) = match request.label {
        Label::Fresh => (1, 0),
        Label::Rotten => (0, 1),
    };
    let receipt = state.reconciler.ingest(fresh, rotten).await?;

    Ok(Json(IngestResponse {
        success: true,
        persisted: receipt.persisted(),
    }))
}

/// Today's committed totals
async fn today_count(State(state): State<AppState>) -> Result<Json<Totals>, ApiError> {
    Ok(Json(state.queries.get_today_totals().await?))
}

/// Daily totals over a trailing window
#[instrument(skip(state, params))]
async fn history(
    State(state): State<AppState>,
    params: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let Query(params) = params?;
    let records = state.queries.get_history(params.days).await?;
    Ok(Json(records.into()))
}

/// Publish the first file field of a multipart upload as the latest image
async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ImageMeta>, ApiError> {
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_owned);
        let content = field.bytes().await?;

        let images = state.images.clone();
        let result = tokio::task::spawn_blocking(move || {
            images.put(&filename, &content, content_type.as_deref())
        })
        .await?;

        return match result {
            Ok(meta) => Ok(Json(meta)),
            Err(e) => {
                if e.is_validation() {
                    metrics::counter!("tally.images.rejected").increment(1);
                }
                Err(e.into())
            }
        };
    }

    Err(ApiError::BadRequest("No file field in upload".to_string()))
}

/// Serve the latest uploaded image
async fn latest_image(State(state): State<AppState>) -> Result<Response, ApiError> {
    let images = state.images.clone();
    let latest = tokio::task::spawn_blocking(move || images.latest())
        .await??
        .ok_or(ApiError::NotFound("No image uploaded yet"))?;

    Ok((
        [
            (header::CONTENT_TYPE, latest.meta.mime_type),
            (header::CACHE_CONTROL, "no-store"),
        ],
        latest.content,
    )
        .into_response())
}

/// Metadata of the latest uploaded image
async fn latest_image_meta(State(state): State<AppState>) -> Result<Json<ImageMeta>, ApiError> {
    state
        .images
        .latest_meta()
        .map(Json)
        .ok_or(ApiError::NotFound("No image uploaded yet"))
}

/// Serve the API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting tally API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

/// Wait for `signal` or for the server task to end on its own, whichever
/// comes first, then cancel `shutdown` and return the server's outcome.
pub async fn serve_until_shutdown<F>(
    mut server: JoinHandle<Result<()>>,
    signal: F,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let early_exit = tokio::select! {
        _ = signal => None,
        joined = &mut server => Some(joined),
    };

    if let Some(joined) = &early_exit {
        match joined {
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Ok(Ok(())) => error!("API server stopped before shutdown was requested"),
            Err(e) => error!(error = %e, "API server task panicked"),
        }
    }

    shutdown.cancel();

    let joined = match early_exit {
        Some(joined) => joined,
        None => server.await,
    };
    joined.context("API server task failed")?
}
