use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use sonoscope_foundation::PipelineState;

use crate::manager::{DeviceView, PerformanceReport, SystemStatus};

use super::{epoch_millis, AppState, ControlResponse};

pub async fn status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.manager.system_status())
}

#[derive(Debug, Serialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceView>,
    pub count: usize,
    pub timestamp: u64,
}

pub async fn list_devices(State(state): State<AppState>) -> Json<DeviceList> {
    let devices = state.manager.list_devices().await;
    Json(DeviceList {
        count: devices.len(),
        devices,
        timestamp: epoch_millis(),
    })
}

pub async fn refresh_devices(State(state): State<AppState>) -> Json<DeviceList> {
    let devices = state.manager.refresh_devices().await;
    Json(DeviceList {
        count: devices.len(),
        devices,
        timestamp: epoch_millis(),
    })
}

pub async fn stop_all(State(state): State<AppState>) -> Json<ControlResponse> {
    let stopped = state.manager.stop_all().await;
    ControlResponse::success(format!("stopped {} devices", stopped))
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub removed_mappings: Vec<String>,
    pub removed_pipelines: usize,
}

pub async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    let (removed_mappings, removed_pipelines) = state.manager.cleanup().await;
    Json(CleanupReport {
        removed_mappings,
        removed_pipelines,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub running_count: usize,
    pub error_count: usize,
    pub subscriber_count: usize,
    pub timestamp: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let statuses = state.manager.all_statuses();
    let running = statuses
        .iter()
        .filter(|s| s.state == PipelineState::Running)
        .count();
    let errors = statuses.iter().filter(|s| s.last_error.is_some()).count();
    let subscribers = statuses.iter().map(|s| s.subscriber_count).sum();
    Json(HealthReport {
        status: if errors == 0 { "healthy" } else { "degraded" },
        running_count: running,
        error_count: errors,
        subscriber_count: subscribers,
        timestamp: epoch_millis(),
    })
}

pub async fn performance(State(state): State<AppState>) -> Json<PerformanceReport> {
    Json(state.manager.performance())
}
