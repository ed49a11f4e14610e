use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Json;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use sonoscope_foundation::{AppError, AudioConfig, AudioConfigPatch, StreamConfig, StreamConfigPatch};

use crate::broadcast::Subscription;
use crate::pipeline::PipelineStatus;

use super::{ApiResult, AppState, ControlResponse};

pub async fn start(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    state.manager.start_device(&device_id).await?;
    Ok(control(format!("device {} started", device_id)))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    state.manager.stop_device(&device_id).await?;
    Ok(control(format!("device {} stopped", device_id)))
}

pub async fn restart(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    state.manager.restart_device(&device_id).await?;
    Ok(control(format!("device {} restarted", device_id)))
}

pub async fn status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<PipelineStatus>> {
    Ok(Json(state.manager.device_status(&device_id)?))
}

/// Long-lived SSE stream: one JSON wire frame per event.
pub async fn stream(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = state.manager.subscribe(&device_id)?;
    Ok(sse_response(subscription))
}

pub fn sse_response(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(subscription, |mut subscription| async move {
        let frame = subscription.recv().await?;
        let event = Event::default().json_data(frame.as_ref()).ok()?;
        Some((Ok(event), subscription))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

pub async fn get_stream_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<StreamConfig>> {
    Ok(Json(state.manager.stream_config(&device_id)?))
}

pub async fn set_stream_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(patch): Json<StreamConfigPatch>,
) -> ApiResult<Json<StreamConfig>> {
    Ok(Json(
        state.manager.update_stream_config(&device_id, &patch).await?,
    ))
}

pub async fn get_audio_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<AudioConfig>> {
    Ok(Json(state.manager.audio_config(&device_id)?))
}

pub async fn set_audio_config(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(patch): Json<AudioConfigPatch>,
) -> ApiResult<Json<AudioConfig>> {
    Ok(Json(
        state.manager.update_audio_config(&device_id, &patch).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveParams {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<RemoveParams>,
) -> ApiResult<Json<ControlResponse>> {
    state.manager.remove_device(&device_id, params.force).await?;
    Ok(control(format!("device {} removed", device_id)))
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub succeeded: usize,
    pub failed: usize,
    pub results: BTreeMap<String, BatchOutcome>,
}

fn batch_response(results: Vec<(String, Result<(), AppError>)>) -> Json<BatchResponse> {
    let mut map = BTreeMap::new();
    let mut succeeded = 0;
    let mut failed = 0;
    for (id, result) in results {
        let outcome = match result {
            Ok(()) => {
                succeeded += 1;
                BatchOutcome {
                    status: "success",
                    message: None,
                }
            }
            Err(e) => {
                failed += 1;
                BatchOutcome {
                    status: "error",
                    message: Some(e.to_string()),
                }
            }
        };
        map.insert(id, outcome);
    }
    Json(BatchResponse {
        succeeded,
        failed,
        results: map,
    })
}

pub async fn batch_start(
    State(state): State<AppState>,
    Json(device_ids): Json<Vec<String>>,
) -> Json<BatchResponse> {
    batch_response(state.manager.batch_start(&device_ids).await)
}

pub async fn batch_stop(
    State(state): State<AppState>,
    Json(device_ids): Json<Vec<String>>,
) -> Json<BatchResponse> {
    batch_response(state.manager.batch_stop(&device_ids).await)
}

fn control(message: String) -> Json<ControlResponse> {
    ControlResponse::success(message)
}
