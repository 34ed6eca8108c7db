use crate::config::ApiConfig;
use crate::gallery::{DeleteOutcome, GalleryPage, GalleryService, ImageDetail, ItemList};
use crate::error::ServiceError;
use crate::ingest::{IngestPipeline, UploadRequest};
use crate::metadata_store::ItemRecord;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the shared API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Room for multipart framing on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub gallery: Arc<GalleryService>,
    /// Required `x-api-key` value, if any
    pub api_key: Option<Arc<str>>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Upload response
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub image_id: Uuid,
    pub status: String,
    pub item_count: usize,
}

/// Query parameters for a gallery page
#[derive(Debug, Deserialize)]
pub struct GalleryQuery {
    /// Only images created strictly before this instant
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(e: &ServiceError) -> StatusCode {
    match e {
        ServiceError::InvalidInput(_) | ServiceError::UnsupportedFormat(_) => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::StorageUnavailable(_)
        | ServiceError::AnalysisUnavailable(_)
        | ServiceError::MalformedAnalysis(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Persistence(_) | ServiceError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(e: ServiceError) -> ApiError {
    let status = status_for(&e);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Request failed");
        "Internal server error".to_string()
    } else {
        e.to_string()
    };

    (
        status,
        Json(ErrorResponse {
            error: message,
            code: e.kind().to_ascii_uppercase(),
        }),
    )
}

fn cors_layer(config: &ApiConfig) -> CorsLayer {
    if !config.cors_enabled {
        return CorsLayer::new();
    }

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
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let body_limit = state.pipeline.config().max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    let protected = Router::new()
        .route("/images", post(upload_image))
        .route("/images/:image_id", get(get_image).delete(delete_image))
        .route("/images/:image_id/items", get(list_image_items))
        .route("/items/:item_id", get(get_item))
        .route("/gallery/:user_id", get(get_gallery))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

/// Reject requests without the configured API key
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected) {
            warn!(path = %request.uri().path(), "Rejected request with missing or invalid API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Missing or invalid API key".to_string(),
                    code: "UNAUTHORIZED".to_string(),
                }),
            )
                .into_response();
        }
    }

    next.run(request).await
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "feedback-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.gallery.repository().ping().await {
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

/// Read the `file` and optional `user_id` fields of an upload form
async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest, ServiceError> {
    let mut file: Option<(Vec<u8>, String, Option<String>)> = None;
    let mut user_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::InvalidInput(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let original_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::InvalidInput(e.body_text()))?;
                file = Some((bytes.to_vec(), content_type, original_name));
            }
            Some("user_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::InvalidInput(e.body_text()))?;
                let parsed = Uuid::parse_str(text.trim())
                    .map_err(|_| ServiceError::InvalidInput(format!("invalid user_id {:?}", text)))?;
                user_id = Some(parsed);
            }
            _ => {}
        }
    }

    let (bytes, content_type, original_name) =
        file.ok_or_else(|| ServiceError::InvalidInput("missing multipart field `file`".to_string()))?;

    Ok(UploadRequest {
        bytes,
        content_type,
        original_name,
        user_id,
    })
}

/// Upload, analyze and persist one image
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let request = read_upload(multipart).await.map_err(api_error)?;
    let outcome = state.pipeline.ingest(request).await.map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            image_id: outcome.image.image_id,
            status: outcome.image.status,
            item_count: outcome.items.len(),
        }),
    ))
}

/// Image metadata, signed URLs and items
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<ImageDetail>, ApiError> {
    state
        .gallery
        .image_detail(image_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
async fn list_image_items(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<ItemList>, ApiError> {
    state
        .gallery
        .items_for_image(image_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
) -> Result<Json<ItemRecord>, ApiError> {
    state
        .gallery
        .get_item(item_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Keyset-paginated gallery for one user
#[instrument(skip(state))]
async fn get_gallery(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(params): Query<GalleryQuery>,
) -> Result<Json<GalleryPage>, ApiError> {
    state
        .gallery
        .gallery(Some(user_id), params.cursor, params.limit)
        .await
        .map(Json)
        .map_err(api_error)
}

#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    state
        .gallery
        .delete_image(image_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Start the feedback API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting feedback API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
