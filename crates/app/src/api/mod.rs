pub mod device;
pub mod legacy;
pub mod system;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sonoscope_foundation::{AppError, AudioError};

use crate::manager::DeviceManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DeviceManager>,
}

/// Uniform body for control verbs.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: u64,
}

impl ControlResponse {
    pub fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success",
            message: Some(message.into()),
            timestamp: epoch_millis(),
        })
    }
}

pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub type ApiResult<T> = Result<T, ApiError>;

/// User-visible failure: names the operation and stable ID, never a
/// backtrace.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let status = match &err {
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::DeviceUnknown { .. } => StatusCode::NOT_FOUND,
            AppError::Audio(AudioError::DeviceNotFound { .. }) => StatusCode::NOT_FOUND,
            AppError::Audio(AudioError::DeviceBusy { .. })
            | AppError::PipelineBusy { .. }
            | AppError::DeviceLimit { .. } => StatusCode::CONFLICT,
            AppError::Audio(AudioError::UnsupportedRate { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct Body {
            status: &'static str,
            message: String,
            timestamp: u64,
        }
        (
            self.status,
            Json(Body {
                status: "error",
                message: self.message,
                timestamp: epoch_millis(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // System control
        .route("/api/system/status", get(system::status))
        .route("/api/system/devices", get(system::list_devices))
        .route("/api/system/devices/refresh", post(system::refresh_devices))
        .route("/api/system/stop-all", post(system::stop_all))
        .route("/api/system/cleanup", post(system::cleanup))
        .route("/api/system/health", get(system::health))
        .route("/api/system/performance", get(system::performance))
        // Per-device control
        .route("/api/devices/batch/start", post(device::batch_start))
        .route("/api/devices/batch/stop", post(device::batch_stop))
        .route("/api/devices/:device_id/start", post(device::start))
        .route("/api/devices/:device_id/stop", post(device::stop))
        .route("/api/devices/:device_id/restart", post(device::restart))
        .route("/api/devices/:device_id/status", get(device::status))
        .route("/api/devices/:device_id/stream", get(device::stream))
        .route(
            "/api/devices/:device_id/config/stream",
            get(device::get_stream_config).post(device::set_stream_config),
        )
        .route(
            "/api/devices/:device_id/config/audio",
            get(device::get_audio_config).post(device::set_audio_config),
        )
        .route("/api/devices/:device_id", delete(device::remove))
        // Legacy single-stream surface
        .route("/api/start", post(legacy::start))
        .route("/api/stop", post(legacy::stop))
        .route("/api/status", get(legacy::status))
        .route("/api/stream", get(legacy::stream))
        .route(
            "/api/config/stream",
            get(legacy::get_stream_config).post(legacy::set_stream_config),
        )
        .route("/api/config/fps", post(legacy::set_fps))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
