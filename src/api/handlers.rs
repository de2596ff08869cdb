//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Multipart, Path, Query, State,
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{error, warn};
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::app::{AppState, IngestionOutcome};
use crate::domain::{
    AppError, BlobRef, CreateItemRequest, CreateItemResponse, CreationStatus, ErrorDetail,
    ErrorKind, ErrorResponse, ExternalServiceError, HealthResponse, HealthStatus,
    ImageLinkedResponse, ImageUpload, Item, ItemFilter, ItemId, RateLimitResponse,
    ValidationError, VersionResponse,
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Item Service API",
        description = "Ingests marketplace items, announces them on the event bus and stores their images",
        license(name = "MIT")
    ),
    paths(
        create_item_handler,
        list_items_handler,
        get_item_handler,
        upload_image_handler,
        get_image_handler,
        announce_item_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
        version_handler,
    ),
    components(
        schemas(
            Item,
            BlobRef,
            CreateItemRequest,
            CreateItemResponse,
            CreationStatus,
            ImageLinkedResponse,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            RateLimitResponse,
            VersionResponse,
        )
    ),
    tags(
        (name = "items", description = "Item ingestion and attachment endpoints"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Query string of `GET /items`.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListItemsQuery {
    /// Exact category code
    pub category: Option<String>,
    /// Location, compared case-insensitively
    pub location: Option<String>,
    #[param(value_type = Option<String>)]
    pub min_price: Option<Decimal>,
    #[param(value_type = Option<String>)]
    pub max_price: Option<Decimal>,
    /// RFC 3339 timestamp, inclusive
    pub date_from: Option<DateTime<Utc>>,
    /// RFC 3339 timestamp, inclusive
    pub date_to: Option<DateTime<Utc>>,
    /// Maximum number of items to return (1-500, default: 100)
    pub limit: Option<usize>,
}

impl ListItemsQuery {
    fn into_filter(self) -> Result<(ItemFilter, Option<usize>), AppError> {
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(invalid_field("min_price", "must not exceed max_price"));
            }
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(invalid_field("date_from", "must not be after date_to"));
            }
        }

        let filter = ItemFilter {
            category: self.category,
            location: self.location,
            min_price: self.min_price,
            max_price: self.max_price,
            date_from: self.date_from,
            date_to: self.date_to,
        };
        Ok((filter, self.limit))
    }
}

fn invalid_field(field: &str, message: impl Into<String>) -> AppError {
    AppError::Validation(ValidationError::InvalidField {
        field: field.to_string(),
        message: message.into(),
    })
}

/// An id that does not parse cannot name an existing item.
fn item_id(path: Result<Path<ItemId>, PathRejection>) -> Result<ItemId, AppError> {
    path.map(|Path(id)| id)
        .map_err(|e| AppError::ItemNotFound(e.body_text()))
}

/// Create a new item
#[utoipa::path(
    post,
    path = "/items",
    tag = "items",
    request_body = CreateItemRequest,
    params(("x-api-key" = String, Header, description = "API key")),
    responses(
        (status = 201, description = "Item created and announced", body = CreateItemResponse),
        (status = 202, description = "Item created, announcement pending", body = CreateItemResponse),
        (status = 400, description = "Invalid payload", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 422, description = "Unknown seller or unsupported category", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse)
    )
)]
pub async fn create_item_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateItemRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) =
        payload.map_err(|e| AppError::Validation(ValidationError::InvalidFormat(e.body_text())))?;

    let response = match state.ingestion.create_item(request).await? {
        IngestionOutcome::Created(item) => (
            StatusCode::CREATED,
            Json(CreateItemResponse {
                status: CreationStatus::Created,
                item,
                warning: None,
            }),
        ),
        IngestionOutcome::CreatedUnannounced { item, reason } => (
            StatusCode::ACCEPTED,
            Json(CreateItemResponse {
                status: CreationStatus::CreatedUnannounced,
                item,
                warning: Some(format!("creation event not published: {reason}")),
            }),
        ),
    };
    Ok(response.into_response())
}

/// List items, optionally filtered
#[utoipa::path(
    get,
    path = "/items",
    tag = "items",
    params(ListItemsQuery),
    responses(
        (status = 200, description = "Matching items in creation order", body = [Item]),
        (status = 400, description = "Invalid filter", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse)
    )
)]
pub async fn list_items_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListItemsQuery>, QueryRejection>,
) -> Result<Json<Vec<Item>>, AppError> {
    let Query(query) =
        query.map_err(|e| AppError::Validation(ValidationError::InvalidFormat(e.body_text())))?;
    let (filter, limit) = query.into_filter()?;

    let items = state.service.list_items(filter, limit).await?;
    Ok(Json(items))
}

/// Get a single item by ID
#[utoipa::path(
    get,
    path = "/items/{id}",
    tag = "items",
    params(("id" = Uuid, Path, description = "Item ID")),
    responses(
        (status = 200, description = "Item found", body = Item),
        (status = 404, description = "Item not found", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = RateLimitResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse)
    )
)]
pub async fn get_item_handler(
    State(state): State<Arc<AppState>>,
    path: Result<Path<ItemId>, PathRejection>,
) -> Result<Json<Item>, AppError> {
    let id = item_id(path)?;
    let item = state
        .service
        .get_item(id)
        .await?
        .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;
    Ok(Json(item))
}

/// Attach an image to an item
///
/// The first file field of the multipart body is used.
#[utoipa::path(
    post,
    path = "/items/{id}/image",
    tag = "items",
    params(
        ("id" = Uuid, Path, description = "Item ID"),
        ("x-api-key" = String, Header, description = "API key")
    ),
    request_body(content_type = "multipart/form-data", description = "One image file field"),
    responses(
        (status = 201, description = "Image stored and linked", body = ImageLinkedResponse),
        (status = 400, description = "Empty or malformed upload", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 404, description = "Item not found", body = ErrorResponse),
        (status = 422, description = "Unsupported, oversized or corrupt image", body = ErrorResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse),
        (status = 507, description = "Blob quota exceeded", body = ErrorResponse)
    )
)]
pub async fn upload_image_handler(
    State(state): State<Arc<AppState>>,
    path: Result<Path<ItemId>, PathRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ImageLinkedResponse>), AppError> {
    let id = item_id(path)?;
    let multipart = multipart
        .map_err(|e| AppError::Validation(ValidationError::InvalidFormat(e.body_text())))?;
    let upload = read_upload(multipart).await?;

    let image = state.attachments.attach_image(id, upload).await?;
    Ok((
        StatusCode::CREATED,
        Json(ImageLinkedResponse { item_id: id, image }),
    ))
}

async fn read_upload(mut multipart: Multipart) -> Result<ImageUpload, AppError> {
    let malformed = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::InvalidMedia(e.body_text())
        } else {
            AppError::Validation(ValidationError::InvalidFormat(e.body_text()))
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.file_name().is_none() {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = field.bytes().await.map_err(malformed)?;
        return Ok(ImageUpload::new(content_type, body));
    }

    Err(AppError::Validation(ValidationError::MissingField(
        "file".to_string(),
    )))
}

/// Download the current image of an item
#[utoipa::path(
    get,
    path = "/items/{id}/image",
    tag = "items",
    params(("id" = Uuid, Path, description = "Item ID")),
    responses(
        (status = 200, description = "Image bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Item not found or without image", body = ErrorResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse)
    )
)]
pub async fn get_image_handler(
    State(state): State<Arc<AppState>>,
    path: Result<Path<ItemId>, PathRejection>,
) -> Result<Response, AppError> {
    let id = item_id(path)?;
    let (image, content) = state.attachments.fetch_image(id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, image.media_type),
            (header::ETAG, format!("\"{}\"", image.key)),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{}\"", image.filename),
            ),
        ],
        content,
    )
        .into_response())
}

/// Retry the creation announcement of an item
#[utoipa::path(
    post,
    path = "/items/{id}/announce",
    tag = "items",
    params(
        ("id" = Uuid, Path, description = "Item ID"),
        ("x-api-key" = String, Header, description = "API key")
    ),
    responses(
        (status = 200, description = "Creation event published", body = Item),
        (status = 404, description = "Item not found", body = ErrorResponse),
        (status = 409, description = "Item is not awaiting announcement", body = ErrorResponse),
        (status = 503, description = "Message bus unavailable", body = ErrorResponse)
    )
)]
pub async fn announce_item_handler(
    State(state): State<Arc<AppState>>,
    path: Result<Path<ItemId>, PathRejection>,
) -> Result<Json<Item>, AppError> {
    let id = item_id(path)?;
    let item = state.ingestion.retry_announcement(id).await?;
    Ok(Json(item))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Service name and version
#[utoipa::path(
    get,
    path = "/version",
    tag = "health",
    responses(
        (status = 200, description = "Build information", body = VersionResponse)
    )
)]
pub async fn version_handler() -> Json<VersionResponse> {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus scrape endpoint
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics {
        Some(ref handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

impl AppError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        if let AppError::ExternalService(e) = self {
            return match e {
                ExternalServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ExternalServiceError::Unavailable(_) | ExternalServiceError::RateLimited(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ExternalServiceError::HttpError(_) => StatusCode::BAD_GATEWAY,
            };
        }

        match self.kind() {
            ErrorKind::InvalidPayload | ErrorKind::EmptyInput => StatusCode::BAD_REQUEST,
            ErrorKind::SellerNotFound
            | ErrorKind::UnsupportedCategory
            | ErrorKind::InvalidMedia => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ItemNotFound => StatusCode::NOT_FOUND,
            ErrorKind::DuplicateId | ErrorKind::AlreadyAnnounced => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::StorageUnavailable
            | ErrorKind::PublishFailed
            | ErrorKind::UserDirectoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.kind().as_str();
        let message = self.to_string();

        if status.is_server_error() {
            error!(error_type, message = %message, "Server error");
        } else {
            warn!(error_type, message = %message, "Request rejected");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
