use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use sonoscope_audio::{DeviceDescriptor, DeviceRegistry, DeviceSelector, ObservedDevice};
use sonoscope_foundation::{
    AppError, AudioConfig, AudioConfigPatch, PipelineState, StreamConfig, StreamConfigPatch,
};

use crate::broadcast::Subscription;
use crate::pipeline::{DevicePipeline, PipelineStatus};
use crate::source::{CaptureSourceFactory, SourceFactory};

/// Concurrent running pipelines the host is allowed to carry.
const DEFAULT_MAX_RUNNING: usize = 8;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub audio_defaults: AudioConfig,
    pub stream_defaults: StreamConfig,
    pub max_running: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            audio_defaults: AudioConfig::default(),
            stream_defaults: StreamConfig::default(),
            max_running: DEFAULT_MAX_RUNNING,
        }
    }
}

/// A registry descriptor decorated with live pipeline state for the
/// device-list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    pub status: &'static str,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running_count: usize,
    pub total_count: usize,
    pub cpu_pct: f32,
    pub memory_bytes: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct PerformanceReport {
    pub system: SystemStatus,
    pub pipelines: Vec<PipelineStatus>,
}

/// Process-wide supervisor: owns the stable-ID registry and one
/// pipeline per device. The map lock guards map mutation only, never a
/// pipeline's own I/O.
pub struct DeviceManager {
    config: ManagerConfig,
    registry: Arc<DeviceRegistry>,
    pipelines: Mutex<Vec<Arc<DevicePipeline>>>,
    factory: Arc<dyn SourceFactory>,
    started_at: Instant,
    system: Mutex<System>,
}

impl DeviceManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_factory(config, Arc::new(CaptureSourceFactory))
    }

    /// Factory injection point: tests drive the supervisor with
    /// synthetic sources instead of cpal hardware.
    pub fn with_factory(config: ManagerConfig, factory: Arc<dyn SourceFactory>) -> Self {
        let registry = Arc::new(DeviceRegistry::load(&config.data_dir));
        Self {
            config,
            registry,
            pipelines: Mutex::new(Vec::new()),
            factory,
            started_at: Instant::now(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn find_pipeline(&self, stable_id: &str) -> Option<Arc<DevicePipeline>> {
        self.pipelines
            .lock()
            .iter()
            .find(|p| p.stable_id() == stable_id)
            .cloned()
    }

    /// Resolve a stable ID to its pipeline, creating one lazily from
    /// the descriptor's defaults.
    fn resolve_pipeline(&self, stable_id: &str) -> Result<Arc<DevicePipeline>, AppError> {
        if let Some(existing) = self.find_pipeline(stable_id) {
            return Ok(existing);
        }
        let descriptor =
            self.registry
                .resolve(stable_id)
                .ok_or_else(|| AppError::DeviceUnknown {
                    stable_id: stable_id.to_string(),
                })?;

        let mut audio = self.config.audio_defaults.clone();
        audio.device_names = vec![descriptor.name.clone()];

        let pipeline = Arc::new(DevicePipeline::new(
            descriptor.stable_id.clone(),
            descriptor.name.clone(),
            audio,
            self.config.stream_defaults,
            self.factory.clone(),
        ));

        let mut pipelines = self.pipelines.lock();
        // Lost race: someone created it while we built ours.
        if let Some(existing) = pipelines.iter().find(|p| p.stable_id() == stable_id) {
            return Ok(existing.clone());
        }
        pipelines.push(pipeline.clone());
        Ok(pipeline)
    }

    fn running_count(&self) -> usize {
        self.pipelines
            .lock()
            .iter()
            .filter(|p| p.state() == PipelineState::Running)
            .count()
    }

    // ── Per-device operations ──────────────────────────────────────

    pub async fn start_device(&self, stable_id: &str) -> Result<(), AppError> {
        let pipeline = self.resolve_pipeline(stable_id)?;
        if pipeline.state() != PipelineState::Running
            && self.running_count() >= self.config.max_running
        {
            return Err(AppError::DeviceLimit {
                limit: self.config.max_running,
            });
        }
        pipeline.start().await
    }

    pub async fn stop_device(&self, stable_id: &str) -> Result<(), AppError> {
        match self.find_pipeline(stable_id) {
            Some(pipeline) => pipeline.stop().await,
            // Absent pipeline is already stopped.
            None => Ok(()),
        }
    }

    pub async fn restart_device(&self, stable_id: &str) -> Result<(), AppError> {
        self.resolve_pipeline(stable_id)?.restart().await
    }

    pub async fn remove_device(&self, stable_id: &str, force: bool) -> Result<(), AppError> {
        let Some(pipeline) = self.find_pipeline(stable_id) else {
            return Ok(());
        };
        if pipeline.state() != PipelineState::Stopped {
            if !force {
                return Err(AppError::PipelineBusy {
                    stable_id: stable_id.to_string(),
                    state: format!("{:?}", pipeline.state()).to_lowercase(),
                });
            }
            pipeline.stop().await?;
        }
        self.pipelines
            .lock()
            .retain(|p| p.stable_id() != stable_id);
        tracing::info!(stable_id = %stable_id, "Pipeline removed");
        Ok(())
    }

    pub fn device_status(&self, stable_id: &str) -> Result<PipelineStatus, AppError> {
        self.find_pipeline(stable_id)
            .map(|p| p.status())
            .ok_or_else(|| AppError::DeviceUnknown {
                stable_id: stable_id.to_string(),
            })
    }

    pub fn subscribe(&self, stable_id: &str) -> Result<Subscription, AppError> {
        Ok(self.resolve_pipeline(stable_id)?.subscribe())
    }

    pub async fn update_stream_config(
        &self,
        stable_id: &str,
        patch: &StreamConfigPatch,
    ) -> Result<StreamConfig, AppError> {
        self.resolve_pipeline(stable_id)?
            .update_stream_config(patch)
            .await
    }

    pub async fn update_audio_config(
        &self,
        stable_id: &str,
        patch: &AudioConfigPatch,
    ) -> Result<AudioConfig, AppError> {
        self.resolve_pipeline(stable_id)?
            .update_audio_config(patch)
            .await
    }

    pub fn stream_config(&self, stable_id: &str) -> Result<StreamConfig, AppError> {
        Ok(self.resolve_pipeline(stable_id)?.stream_config())
    }

    pub fn audio_config(&self, stable_id: &str) -> Result<AudioConfig, AppError> {
        Ok(self.resolve_pipeline(stable_id)?.audio_config())
    }

    // ── System operations ──────────────────────────────────────────

    /// Re-enumerate the host's input devices into the registry and
    /// persist the result.
    pub async fn refresh_devices(&self) -> Vec<DeviceView> {
        let (observed, default_name) = tokio::task::spawn_blocking(|| {
            let selector = DeviceSelector::new();
            (selector.scan(), selector.default_input_name())
        })
        .await
        .unwrap_or_default();
        self.merge_enumeration(&observed, default_name)
    }

    /// Registry merge that tests drive directly with synthetic scans.
    pub fn merge_enumeration(
        &self,
        observed: &[ObservedDevice],
        default_name: Option<String>,
    ) -> Vec<DeviceView> {
        let descriptors = self.registry.enumerate(observed);
        if let Err(e) = self.registry.persist() {
            tracing::warn!("Failed to persist device registry: {}", e);
        }

        descriptors
            .into_iter()
            .map(|descriptor| {
                let status = match self.find_pipeline(&descriptor.stable_id) {
                    Some(p) => match p.state() {
                        PipelineState::Running => "running",
                        _ if p.last_error().is_some() => "error",
                        _ => "stopped",
                    },
                    None if descriptor.missed_scans == 0 => "available",
                    None => "absent",
                };
                let is_default = default_name
                    .as_deref()
                    .map(|d| d == descriptor.name)
                    .unwrap_or(false);
                DeviceView {
                    descriptor,
                    status,
                    is_default,
                }
            })
            .collect()
    }

    pub async fn list_devices(&self) -> Vec<DeviceView> {
        self.refresh_devices().await
    }

    pub async fn stop_all(&self) -> usize {
        let pipelines: Vec<_> = self.pipelines.lock().clone();
        let mut stopped = 0;
        for pipeline in pipelines {
            if pipeline.state() == PipelineState::Running {
                if pipeline.stop().await.is_ok() {
                    stopped += 1;
                }
            }
        }
        tracing::info!(count = stopped, "Stopped all pipelines");
        stopped
    }

    pub async fn batch_start(&self, stable_ids: &[String]) -> Vec<(String, Result<(), AppError>)> {
        let mut results = Vec::with_capacity(stable_ids.len());
        for id in stable_ids {
            results.push((id.clone(), self.start_device(id).await));
        }
        results
    }

    pub async fn batch_stop(&self, stable_ids: &[String]) -> Vec<(String, Result<(), AppError>)> {
        let mut results = Vec::with_capacity(stable_ids.len());
        for id in stable_ids {
            results.push((id.clone(), self.stop_device(id).await));
        }
        results
    }

    /// Drop registry descriptors that have aged out and pipelines that
    /// died with an error. Running pipelines always keep their mapping.
    pub async fn cleanup(&self) -> (Vec<String>, usize) {
        let owned: HashSet<String> = self
            .pipelines
            .lock()
            .iter()
            .filter(|p| p.state() == PipelineState::Running)
            .map(|p| p.stable_id().to_string())
            .collect();
        let removed_ids = self.registry.cleanup(&owned);
        if let Err(e) = self.registry.persist() {
            tracing::warn!("Failed to persist device registry: {}", e);
        }

        let dead: Vec<Arc<DevicePipeline>> = self
            .pipelines
            .lock()
            .iter()
            .filter(|p| p.state() == PipelineState::Stopped && p.last_error().is_some())
            .cloned()
            .collect();
        let dead_count = dead.len();
        for pipeline in dead {
            let id = pipeline.stable_id().to_string();
            let _ = self.remove_device(&id, false).await;
        }
        (removed_ids, dead_count)
    }

    pub fn system_status(&self) -> SystemStatus {
        let (cpu_pct, memory_bytes) = self.process_usage();
        SystemStatus {
            running_count: self.running_count(),
            total_count: self.pipelines.lock().len(),
            cpu_pct,
            memory_bytes,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    pub fn performance(&self) -> PerformanceReport {
        let pipelines = self.pipelines.lock().iter().map(|p| p.status()).collect();
        PerformanceReport {
            system: self.system_status(),
            pipelines,
        }
    }

    pub fn all_statuses(&self) -> Vec<PipelineStatus> {
        self.pipelines.lock().iter().map(|p| p.status()).collect()
    }

    fn process_usage(&self) -> (f32, u64) {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| (p.cpu_usage(), p.memory()))
            .unwrap_or((0.0, 0))
    }

    // ── Legacy single-stream surface ───────────────────────────────

    /// The first running pipeline, or one bound to the host default
    /// device if nothing is running yet.
    pub async fn default_pipeline(&self) -> Result<Arc<DevicePipeline>, AppError> {
        if let Some(running) = self
            .pipelines
            .lock()
            .iter()
            .find(|p| p.state() == PipelineState::Running)
        {
            return Ok(running.clone());
        }

        let views = self.refresh_devices().await;
        let chosen = views
            .iter()
            .find(|v| v.is_default)
            .or_else(|| views.iter().find(|v| v.descriptor.missed_scans == 0))
            .ok_or(AppError::DeviceUnknown {
                stable_id: "default".to_string(),
            })?;
        self.resolve_pipeline(&chosen.descriptor.stable_id)
    }

    pub async fn start_default(&self) -> Result<String, AppError> {
        let pipeline = self.default_pipeline().await?;
        if pipeline.state() != PipelineState::Running
            && self.running_count() >= self.config.max_running
        {
            return Err(AppError::DeviceLimit {
                limit: self.config.max_running,
            });
        }
        pipeline.start().await?;
        Ok(pipeline.stable_id().to_string())
    }

    pub async fn stop_default(&self) -> Result<(), AppError> {
        let pipeline = self.default_pipeline().await?;
        pipeline.stop().await
    }
}
