//! DeviceManager tests over synthetic enumerations and sources: stable
//! resolution, lifecycle supervision, limits and cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sonoscope_app::manager::{DeviceManager, ManagerConfig};
use sonoscope_app::source::{BlockSource, SourceFactory};
use sonoscope_audio::{stable_id, ObservedDevice};
use sonoscope_foundation::{AppError, AudioConfig, AudioError, PipelineState, StreamConfig};
use sonoscope_telemetry::PipelineMetrics;
use tempfile::TempDir;

struct ToneSource;

impl BlockSource for ToneSource {
    fn read_block(&mut self, max_samples: usize) -> Option<Vec<f32>> {
        let len = max_samples.min(1024);
        Some(
            (0..len)
                .map(|i| 0.4 * (std::f32::consts::TAU * 10_000.0 * i as f32 / 48_000.0).sin())
                .collect(),
        )
    }

    fn is_failed(&self) -> bool {
        false
    }

    fn take_error(&mut self) -> Option<String> {
        None
    }

    fn close(&mut self) {}
}

struct ToneFactory {
    opens: AtomicUsize,
}

impl SourceFactory for ToneFactory {
    fn open(
        &self,
        _config: &AudioConfig,
        _metrics: Arc<PipelineMetrics>,
    ) -> Result<Box<dyn BlockSource>, AudioError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ToneSource))
    }
}

fn mic(index: usize, name: &str) -> ObservedDevice {
    ObservedDevice {
        system_index: index,
        name: name.to_string(),
        max_input_channels: 1,
        default_sample_rate: 48_000.0,
    }
}

fn manager(dir: &TempDir, max_running: usize) -> Arc<DeviceManager> {
    let config = ManagerConfig {
        data_dir: dir.path().to_path_buf(),
        audio_defaults: AudioConfig {
            sample_rate: 48_000,
            block_size: 1024,
            fft_size: 1024,
            overlap: 0.0,
            ..Default::default()
        },
        stream_defaults: StreamConfig {
            magnitude_threshold_db: -200.0,
            enable_smart_skip: false,
            enable_adaptive_fps: false,
            ..Default::default()
        },
        max_running,
    };
    Arc::new(DeviceManager::with_factory(
        config,
        Arc::new(ToneFactory {
            opens: AtomicUsize::new(0),
        }),
    ))
}

#[tokio::test]
async fn start_requires_a_known_device() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    let err = mgr.start_device("nope_000000").await.unwrap_err();
    assert!(matches!(err, AppError::DeviceUnknown { .. }));
}

#[tokio::test]
async fn start_stop_lifecycle_via_stable_id() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "UltraMic384K")], None);
    let id = stable_id("UltraMic384K", 1, 48_000.0);

    mgr.start_device(&id).await.unwrap();
    let status = mgr.device_status(&id).unwrap();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(mgr.system_status().running_count, 1);

    mgr.stop_device(&id).await.unwrap();
    assert_eq!(
        mgr.device_status(&id).unwrap().state,
        PipelineState::Stopped
    );
    // Stop leaves the pipeline object alive but idle.
    assert_eq!(mgr.system_status().total_count, 1);
}

#[tokio::test]
async fn stopping_an_absent_device_is_fine() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.stop_device("ghost_aaaaaa").await.unwrap();
}

#[tokio::test]
async fn concurrent_device_limit_is_enforced() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 1);
    mgr.merge_enumeration(&[mic(0, "Mic A"), mic(1, "Mic B")], None);
    let id_a = stable_id("Mic A", 1, 48_000.0);
    let id_b = stable_id("Mic B", 1, 48_000.0);

    mgr.start_device(&id_a).await.unwrap();
    let err = mgr.start_device(&id_b).await.unwrap_err();
    assert!(matches!(err, AppError::DeviceLimit { limit: 1 }));

    // Starting an already-running device stays idempotent under the limit.
    mgr.start_device(&id_a).await.unwrap();

    mgr.stop_device(&id_a).await.unwrap();
    mgr.start_device(&id_b).await.unwrap();
    mgr.stop_all().await;
}

#[tokio::test]
async fn remove_refuses_running_pipeline_without_force() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "Mic A")], None);
    let id = stable_id("Mic A", 1, 48_000.0);

    mgr.start_device(&id).await.unwrap();
    let err = mgr.remove_device(&id, false).await.unwrap_err();
    assert!(matches!(err, AppError::PipelineBusy { .. }));

    mgr.remove_device(&id, true).await.unwrap();
    assert_eq!(mgr.system_status().total_count, 0);
}

#[tokio::test]
async fn batch_operations_report_per_device() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "Mic A")], None);
    let id = stable_id("Mic A", 1, 48_000.0);

    let results = mgr
        .batch_start(&[id.clone(), "ghost_bbbbbb".to_string()])
        .await;
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());

    let results = mgr.batch_stop(&[id.clone()]).await;
    assert!(results[0].1.is_ok());
}

#[tokio::test]
async fn stop_all_stops_every_running_pipeline() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "Mic A"), mic(1, "Mic B")], None);
    mgr.start_device(&stable_id("Mic A", 1, 48_000.0)).await.unwrap();
    mgr.start_device(&stable_id("Mic B", 1, 48_000.0)).await.unwrap();

    assert_eq!(mgr.stop_all().await, 2);
    assert_eq!(mgr.system_status().running_count, 0);
}

#[tokio::test]
async fn subscribe_creates_the_pipeline_lazily() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "Mic A")], None);
    let id = stable_id("Mic A", 1, 48_000.0);

    // No pipeline yet; subscribing materializes one without starting it.
    let _sub = mgr.subscribe(&id).unwrap();
    let status = mgr.device_status(&id).unwrap();
    assert_eq!(status.state, PipelineState::Stopped);
    assert_eq!(status.subscriber_count, 1);
}

#[tokio::test]
async fn cleanup_keeps_running_devices_mapped() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    mgr.merge_enumeration(&[mic(0, "Mic A"), mic(1, "Mic B")], None);
    let id_a = stable_id("Mic A", 1, 48_000.0);
    let id_b = stable_id("Mic B", 1, 48_000.0);
    mgr.start_device(&id_a).await.unwrap();

    // Both devices disappear from enumeration long enough to age out.
    for _ in 0..5 {
        mgr.merge_enumeration(&[], None);
    }
    let (removed, _) = mgr.cleanup().await;
    assert_eq!(removed, vec![id_b]);
    assert!(mgr.registry().resolve(&id_a).is_some());

    mgr.stop_all().await;
}

#[tokio::test]
async fn device_views_reflect_pipeline_state() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir, 8);
    let views = mgr.merge_enumeration(&[mic(0, "Mic A")], Some("Mic A".to_string()));
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].status, "available");
    assert!(views[0].is_default);

    let id = stable_id("Mic A", 1, 48_000.0);
    mgr.start_device(&id).await.unwrap();
    let views = mgr.merge_enumeration(&[mic(0, "Mic A")], None);
    assert_eq!(views[0].status, "running");

    mgr.stop_device(&id).await.unwrap();
    let views = mgr.merge_enumeration(&[mic(0, "Mic A")], None);
    assert_eq!(views[0].status, "stopped");
}

#[tokio::test]
async fn registry_survives_manager_restart() {
    let dir = TempDir::new().unwrap();
    let id = {
        let mgr = manager(&dir, 8);
        let views = mgr.merge_enumeration(&[mic(0, "UltraMic384K")], None);
        views[0].descriptor.stable_id.clone()
    };

    let mgr = manager(&dir, 8);
    assert!(mgr.registry().resolve(&id).is_some());
}
