//! Single-stream surface kept for visualizers that predate multi-device
//! support. Every verb operates on the first running pipeline, or on
//! one bound to the host default device when nothing is running.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::Json;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};

use sonoscope_foundation::{PipelineState, StreamConfig, StreamConfigPatch};

use super::device::sse_response;
use super::{ApiResult, AppState, ControlResponse};

#[derive(Debug, Serialize)]
pub struct LegacyStatus {
    pub is_running: bool,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub current_fps: f64,
    pub connected_clients: usize,
    pub total_frames_sent: u64,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
}

pub async fn start(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    let stable_id = state.manager.start_default().await?;
    Ok(ControlResponse::success(format!(
        "streaming started on {}",
        stable_id
    )))
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    state.manager.stop_default().await?;
    Ok(ControlResponse::success("streaming stopped"))
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<LegacyStatus>> {
    match state.manager.default_pipeline().await {
        Ok(pipeline) => {
            let status = pipeline.status();
            Ok(Json(LegacyStatus {
                is_running: status.state == PipelineState::Running,
                device_id: Some(status.stable_id),
                device_name: Some(status.device_name),
                current_fps: status.observed_fps,
                connected_clients: status.subscriber_count,
                total_frames_sent: status.total_published,
                uptime_seconds: status.uptime_ms as f64 / 1000.0,
                last_error: status.last_error,
            }))
        }
        Err(_) => Ok(Json(LegacyStatus {
            is_running: false,
            device_id: None,
            device_name: None,
            current_fps: 0.0,
            connected_clients: 0,
            total_frames_sent: 0,
            uptime_seconds: 0.0,
            last_error: None,
        })),
    }
}

pub async fn stream(
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let pipeline = state.manager.default_pipeline().await?;
    Ok(sse_response(pipeline.subscribe()))
}

pub async fn get_stream_config(
    State(state): State<AppState>,
) -> ApiResult<Json<StreamConfig>> {
    let pipeline = state.manager.default_pipeline().await?;
    Ok(Json(pipeline.stream_config()))
}

pub async fn set_stream_config(
    State(state): State<AppState>,
    Json(patch): Json<StreamConfigPatch>,
) -> ApiResult<Json<StreamConfig>> {
    let pipeline = state.manager.default_pipeline().await?;
    Ok(Json(pipeline.update_stream_config(&patch).await?))
}

#[derive(Debug, Deserialize)]
pub struct FpsParams {
    pub fps: u32,
}

pub async fn set_fps(
    State(state): State<AppState>,
    Query(params): Query<FpsParams>,
) -> ApiResult<Json<StreamConfig>> {
    let pipeline = state.manager.default_pipeline().await?;
    let patch = StreamConfigPatch {
        target_fps: Some(params.fps),
        ..Default::default()
    };
    Ok(Json(pipeline.update_stream_config(&patch).await?))
}
