//! REST API Handlers
//!
//! HTTP surface over the driver facade: volume lifecycle, device lookup,
//! node identity, health and metrics.

use crate::domain::Volume;
use crate::driver::{BlockDeviceDriver, DriverError, DriverErrorKind};
use crate::error::{Error, Result};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Capacity as raw bytes or a unit string such as "10Gi"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Bytes(u64),
    Text(String),
}

impl SizeSpec {
    pub fn to_bytes(&self) -> Result<u64> {
        match self {
            SizeSpec::Bytes(bytes) => Ok(*bytes),
            SizeSpec::Text(text) => parse_capacity(text),
        }
    }
}

/// Volume creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub dataset_id: String,
    pub size: SizeSpec,
    /// Storage profile name
    #[serde(default)]
    pub profile: Option<String>,
}

/// Attach request; the host defaults to this node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachVolumeRequest {
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeVolumeRequest {
    pub size: SizeSpec,
}

/// Volume as reported over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResponse {
    pub dataset_id: String,
    pub volume_id: String,
    pub size_bytes: u64,
    pub attached_to: Option<String>,
    pub folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
}

impl From<Volume> for VolumeResponse {
    fn from(volume: Volume) -> Self {
        Self {
            dataset_id: volume.dataset_id.to_string(),
            volume_id: volume.array_volume_id,
            size_bytes: volume.size_bytes,
            attached_to: volume.attached_host,
            folder: volume.folder_path,
            device_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePathResponse {
    pub dataset_id: String,
    pub device_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub compute_instance_id: String,
    pub allocation_unit: u64,
    pub version: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
}

fn status_for(kind: DriverErrorKind) -> StatusCode {
    match kind {
        DriverErrorKind::UnknownVolume => StatusCode::NOT_FOUND,
        DriverErrorKind::UnattachedVolume | DriverErrorKind::AlreadyAttachedVolume => {
            StatusCode::CONFLICT
        }
        DriverErrorKind::InvalidArgument | DriverErrorKind::InvalidSize => {
            StatusCode::BAD_REQUEST
        }
        DriverErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        DriverErrorKind::DeviceNotReady => StatusCode::GATEWAY_TIMEOUT,
        DriverErrorKind::VolumeException => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Driver errors rendered as JSON with a status matching their kind
struct ApiError(DriverError);

impl From<DriverError> for ApiError {
    fn from(err: DriverError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        (
            status_for(err.kind),
            Json(ApiErrorResponse {
                error: err.kind.as_str().into(),
                message: err.to_string(),
                dataset_id: err.dataset_id.map(|id| id.to_string()),
            }),
        )
            .into_response()
    }
}

fn bad_request(error: &str, message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiErrorResponse {
            error: error.into(),
            message,
            dataset_id: None,
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    driver: Arc<BlockDeviceDriver>,
}

impl RestRouter {
    pub fn new(driver: Arc<BlockDeviceDriver>) -> Self {
        Self { driver }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            driver: self.driver,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", get(list_volumes).post(create_volume))
            .route("/v1/volumes/:id", get(get_volume).delete(destroy_volume))
            .route("/v1/volumes/:id/attach", post(attach_volume))
            .route("/v1/volumes/:id/detach", post(detach_volume))
            .route("/v1/volumes/:id/resize", post(resize_volume))
            .route("/v1/volumes/:id/device", get(get_device_path))
            // Node identity
            .route("/v1/instance", get(get_instance))
            // Health and metrics
            .route("/healthz", get(health_check))
            .route("/readyz", get(readiness_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    driver: Arc<BlockDeviceDriver>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_volumes(State(state): State<AppState>) -> std::result::Result<Response, ApiError> {
    let volumes: Vec<VolumeResponse> = state
        .driver
        .list_volumes()
        .await?
        .into_iter()
        .map(VolumeResponse::from)
        .collect();
    Ok((StatusCode::OK, Json(volumes)).into_response())
}

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> std::result::Result<Response, ApiError> {
    let size_bytes = match request.size.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => return Ok(bad_request("invalid_size", format!("Invalid size: {}", e))),
    };
    info!(dataset_id = %request.dataset_id, size_bytes, "Create volume requested");

    let volume = state
        .driver
        .create_volume_with_profile(&request.dataset_id, size_bytes, request.profile.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(VolumeResponse::from(volume))).into_response())
}

async fn get_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let volume = state.driver.describe_volume(&id).await?;
    Ok((StatusCode::OK, Json(VolumeResponse::from(volume))).into_response())
}

async fn destroy_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    state.driver.destroy_volume(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<AttachVolumeRequest>>,
) -> std::result::Result<Response, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let host = request
        .host
        .unwrap_or_else(|| state.driver.compute_instance_id().to_string());

    let attachment = state.driver.attach(&id, &host).await?;
    let mut response = VolumeResponse::from(attachment.volume);
    response.device_path = Some(attachment.device_path.display().to_string());
    Ok((StatusCode::OK, Json(response)).into_response())
}

async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    state.driver.detach_volume(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn resize_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeVolumeRequest>,
) -> std::result::Result<Response, ApiError> {
    let size_bytes = match request.size.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => return Ok(bad_request("invalid_size", format!("Invalid size: {}", e))),
    };
    let volume = state.driver.resize_volume(&id, size_bytes).await?;
    Ok((StatusCode::OK, Json(VolumeResponse::from(volume))).into_response())
}

async fn get_device_path(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let path = state.driver.get_device_path(&id).await?;
    Ok((
        StatusCode::OK,
        Json(DevicePathResponse {
            dataset_id: id,
            device_path: path.display().to_string(),
        }),
    )
        .into_response())
}

async fn get_instance(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(InstanceResponse {
            compute_instance_id: state.driver.compute_instance_id().to_string(),
            allocation_unit: state.driver.allocation_unit(),
            version: crate::VERSION.to_string(),
        }),
    )
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready once the registry has been loaded from the array
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.driver.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "registry not loaded")
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.driver.metrics().gather() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "Metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse capacity string (e.g., "10Gi", "1T", "1073741824") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::SizeParse("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map_or(s.len(), |(i, _)| i);
    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        _ => return Err(Error::SizeParse(format!("unknown unit: {}", unit_str))),
    };

    Ok((num * multiplier as f64) as u64)
}
