use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use sonoscope_dsp::{encode, SkipReason, SpectrumProcessor, StreamThrottler, ThrottleDecision};
use sonoscope_foundation::{
    AppError, AudioConfig, AudioConfigPatch, PipelineState, StateMachine, StreamConfig,
    StreamConfigPatch, RESTART_BACKOFF,
};
use sonoscope_telemetry::PipelineMetrics;

use crate::broadcast::{Broadcaster, Subscription};
use crate::source::{BlockSource, SourceFactory};

/// Wait for the processor task to wind down before abandoning it.
const PROCESSOR_STOP_GRACE: Duration = Duration::from_secs(3);
/// Poll interval of the processor loop when the ring is empty.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// One device's capture -> FFT -> throttle -> encode -> fan-out chain.
/// The broadcaster outlives restarts, so subscribers stay attached and
/// simply observe a sequence gap.
pub struct DevicePipeline {
    stable_id: String,
    device_name: String,
    audio_config: Arc<RwLock<AudioConfig>>,
    stream_config: Arc<RwLock<StreamConfig>>,
    state: StateMachine,
    broadcaster: Broadcaster,
    metrics: Arc<PipelineMetrics>,
    factory: Arc<dyn SourceFactory>,
    sequence: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    started_at: RwLock<Option<Instant>>,
    worker: Mutex<Option<Worker>>,
    /// Serializes start/stop/restart and config updates.
    op_lock: tokio::sync::Mutex<()>,
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipCounters {
    pub magnitude: u64,
    pub similarity: u64,
    pub pacing: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub stable_id: String,
    pub device_name: String,
    pub state: PipelineState,
    pub last_error: Option<String>,
    pub uptime_ms: u64,
    pub observed_fps: f64,
    pub frames_processed: u64,
    pub frames_emitted: u64,
    pub blocks_captured: u64,
    pub overruns: u64,
    pub restart_count: u64,
    pub skipped: SkipCounters,
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_dropped: u64,
    pub audio_config: AudioConfig,
    pub stream_config: StreamConfig,
}

impl DevicePipeline {
    pub fn new(
        stable_id: String,
        device_name: String,
        audio_config: AudioConfig,
        stream_config: StreamConfig,
        factory: Arc<dyn SourceFactory>,
    ) -> Self {
        Self {
            stable_id,
            device_name,
            audio_config: Arc::new(RwLock::new(audio_config)),
            stream_config: Arc::new(RwLock::new(stream_config)),
            state: StateMachine::new(),
            broadcaster: Broadcaster::new(),
            metrics: Arc::new(PipelineMetrics::default()),
            factory,
            sequence: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            started_at: RwLock::new(None),
            worker: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Idempotent: starting a running pipeline is a no-op.
    pub async fn start(&self) -> Result<(), AppError> {
        let _guard = self.op_lock.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), AppError> {
        if self.state.current() == PipelineState::Running {
            return Ok(());
        }
        // A worker whose processor exhausted its restarts leaves a
        // finished handle behind; clear it before starting again.
        self.worker.lock().take();

        self.state.transition(PipelineState::Starting)?;
        tracing::info!(stable_id = %self.stable_id, "Starting pipeline");

        let config = self.audio_config.read().clone();
        let factory = self.factory.clone();
        let metrics = self.metrics.clone();
        let opened = tokio::task::spawn_blocking(move || factory.open(&config, metrics))
            .await
            .map_err(|e| AppError::Fatal(format!("source open task failed: {}", e)))?;

        let source = match opened {
            Ok(source) => source,
            Err(e) => {
                *self.last_error.write() = Some(e.to_string());
                self.state.transition(PipelineState::Stopped)?;
                tracing::warn!(stable_id = %self.stable_id, "Pipeline start failed: {}", e);
                return Err(AppError::Audio(e));
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = ProcessorCtx {
            stable_id: self.stable_id.clone(),
            stop: stop.clone(),
            state: self.state.clone(),
            audio_config: self.audio_config.clone(),
            stream_config: self.stream_config.clone(),
            broadcaster: self.broadcaster.clone(),
            metrics: self.metrics.clone(),
            sequence: self.sequence.clone(),
            last_error: self.last_error.clone(),
            factory: self.factory.clone(),
        };
        let handle = tokio::spawn(run_processor(ctx, source));

        *self.worker.lock() = Some(Worker { handle, stop });
        *self.last_error.write() = None;
        *self.started_at.write() = Some(Instant::now());
        self.state.transition(PipelineState::Running)?;
        Ok(())
    }

    /// Idempotent: stopping a stopped pipeline is a no-op. Workers get
    /// a grace period, then are detached. No data is flushed.
    pub async fn stop(&self) -> Result<(), AppError> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<(), AppError> {
        if self.state.current() == PipelineState::Running {
            self.state.transition(PipelineState::Stopping)?;
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            let mut handle = worker.handle;
            if tokio::time::timeout(PROCESSOR_STOP_GRACE, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    stable_id = %self.stable_id,
                    "Processor did not stop within grace period; aborting"
                );
                handle.abort();
            }
        }

        if self.state.current() == PipelineState::Stopping {
            self.state.transition(PipelineState::Stopped)?;
        }
        *self.started_at.write() = None;
        tracing::info!(stable_id = %self.stable_id, "Pipeline stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), AppError> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Hot-apply a stream config change; the processor picks up the new
    /// snapshot on its next frame.
    pub async fn update_stream_config(&self, patch: &StreamConfigPatch) -> Result<StreamConfig, AppError> {
        let _guard = self.op_lock.lock().await;
        let next = patch.merge(&self.stream_config.read())?;
        *self.stream_config.write() = next;
        tracing::info!(stable_id = %self.stable_id, "Stream config updated");
        Ok(next)
    }

    /// Audio config changes reopen the device. Subscribers stay
    /// attached across the internal restart.
    pub async fn update_audio_config(&self, patch: &AudioConfigPatch) -> Result<AudioConfig, AppError> {
        let _guard = self.op_lock.lock().await;
        let next = patch.merge(&self.audio_config.read())?;
        let was_running = self.state.current() == PipelineState::Running;
        if was_running && patch.needs_restart() {
            self.stop_locked().await?;
            *self.audio_config.write() = next.clone();
            self.start_locked().await?;
        } else {
            *self.audio_config.write() = next.clone();
        }
        tracing::info!(stable_id = %self.stable_id, "Audio config updated");
        Ok(next)
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn audio_config(&self) -> AudioConfig {
        self.audio_config.read().clone()
    }

    pub fn stream_config(&self) -> StreamConfig {
        *self.stream_config.read()
    }

    pub fn status(&self) -> PipelineStatus {
        let snapshot = self.broadcaster.snapshot();
        let uptime_ms = match (self.state.current(), *self.started_at.read()) {
            (PipelineState::Running, Some(at)) => at.elapsed().as_millis() as u64,
            _ => 0,
        };
        PipelineStatus {
            stable_id: self.stable_id.clone(),
            device_name: self.device_name.clone(),
            state: self.state.current(),
            last_error: self.last_error(),
            uptime_ms,
            observed_fps: self.metrics.observed_emit_fps(),
            frames_processed: self.metrics.frames_processed.load(Ordering::Relaxed),
            frames_emitted: self.metrics.frames_emitted.load(Ordering::Relaxed),
            blocks_captured: self.metrics.blocks_captured.load(Ordering::Relaxed),
            overruns: self.metrics.overruns.load(Ordering::Relaxed),
            restart_count: self.metrics.restart_count.load(Ordering::Relaxed),
            skipped: SkipCounters {
                magnitude: self.metrics.skipped_magnitude.load(Ordering::Relaxed),
                similarity: self.metrics.skipped_similarity.load(Ordering::Relaxed),
                pacing: self.metrics.skipped_pacing.load(Ordering::Relaxed),
            },
            subscriber_count: snapshot.subscriber_count,
            total_published: snapshot.total_published,
            total_dropped: snapshot.total_dropped,
            audio_config: self.audio_config(),
            stream_config: self.stream_config(),
        }
    }
}

struct ProcessorCtx {
    stable_id: String,
    stop: Arc<AtomicBool>,
    state: StateMachine,
    audio_config: Arc<RwLock<AudioConfig>>,
    stream_config: Arc<RwLock<StreamConfig>>,
    broadcaster: Broadcaster,
    metrics: Arc<PipelineMetrics>,
    sequence: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    factory: Arc<dyn SourceFactory>,
}

/// Processor worker: drains the source, windows into spectra, throttles,
/// encodes, publishes. Also the supervisor for the source: a dead
/// source is reopened up to three times with backoff before the
/// pipeline gives up and parks itself in `Stopped`.
async fn run_processor(ctx: ProcessorCtx, mut source: Box<dyn BlockSource>) {
    let (spectrum, read_chunk) = {
        let audio = ctx.audio_config.read();
        let stream = ctx.stream_config.read();
        let processor = SpectrumProcessor::new(
            audio.sample_rate,
            audio.fft_size,
            audio.overlap,
            audio.window,
            stream.threshold_db,
        );
        (processor, audio.block_size)
    };
    let mut spectrum = match spectrum {
        Ok(s) => s,
        Err(e) => {
            *ctx.last_error.write() = Some(e.to_string());
            tracing::error!(stable_id = %ctx.stable_id, "Processor setup failed: {}", e);
            source.close();
            let _ = ctx.state.transition(PipelineState::Stopped);
            return;
        }
    };

    let mut stream_cfg = *ctx.stream_config.read();
    let mut throttler = StreamThrottler::new(stream_cfg);
    let (mut window_kind, mut overlap) = {
        let audio = ctx.audio_config.read();
        (audio.window, audio.overlap)
    };
    let mut wait_accum = Duration::ZERO;
    // Reopen budget for the current failure episode; refilled once the
    // source delivers data again.
    let mut respawn_attempts: usize = 0;

    tracing::debug!(stable_id = %ctx.stable_id, "Processor started");

    while !ctx.stop.load(Ordering::SeqCst) {
        // Hot config pickup: cheap snapshot per iteration, applied only
        // on change.
        let cfg = *ctx.stream_config.read();
        if cfg != stream_cfg {
            throttler.update_config(cfg);
            spectrum.set_threshold_db(cfg.threshold_db);
            stream_cfg = cfg;
        }
        {
            let audio = ctx.audio_config.read();
            if audio.window != window_kind {
                spectrum.set_window_kind(audio.window);
                window_kind = audio.window;
            }
            if audio.overlap != overlap {
                if spectrum.set_overlap(audio.overlap).is_ok() {
                    overlap = audio.overlap;
                }
            }
        }

        if source.is_failed() {
            match respawn_source(&ctx, source, &mut respawn_attempts).await {
                Some(next) => {
                    source = next;
                    continue;
                }
                None => {
                    let _ = ctx.state.transition(PipelineState::Stopped);
                    return;
                }
            }
        }

        match source.read_block(read_chunk) {
            Some(block) => {
                respawn_attempts = 0;
                throttler.observe_producer_wait(wait_accum);
                wait_accum = Duration::ZERO;

                for mut frame in spectrum.push(&block) {
                    frame.sequence_id = ctx.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                    ctx.metrics
                        .frames_processed
                        .fetch_add(1, Ordering::Relaxed);

                    match throttler.decide(&frame) {
                        ThrottleDecision::Emit => {
                            let fps = throttler.observed_fps();
                            frame.fps = fps as f32;
                            match encode(&frame, stream_cfg.compression_level) {
                                Ok(wire) => {
                                    ctx.broadcaster.publish(wire);
                                    ctx.metrics
                                        .frames_emitted
                                        .fetch_add(1, Ordering::Relaxed);
                                    ctx.metrics.update_emit_fps(fps);
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        stable_id = %ctx.stable_id,
                                        "Frame encoding failed: {}", e
                                    );
                                }
                            }
                        }
                        ThrottleDecision::Skip(reason) => {
                            let counter = match reason {
                                SkipReason::Magnitude => &ctx.metrics.skipped_magnitude,
                                SkipReason::Similarity => &ctx.metrics.skipped_similarity,
                                SkipReason::Pacing => &ctx.metrics.skipped_pacing,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                // A saturated source would otherwise pin this worker.
                tokio::task::yield_now().await;
            }
            None => {
                tokio::time::sleep(IDLE_POLL).await;
                wait_accum += IDLE_POLL;
            }
        }
    }

    source.close();
    tracing::debug!(stable_id = %ctx.stable_id, "Processor exited");
}

/// Transient-failure path: close the dead source, then retry the
/// factory on the fixed backoff schedule. `attempts` carries the budget
/// across episodes so a source that keeps dying without ever delivering
/// a block cannot restart forever. `None` parks the pipeline.
async fn respawn_source(
    ctx: &ProcessorCtx,
    mut dead: Box<dyn BlockSource>,
    attempts: &mut usize,
) -> Option<Box<dyn BlockSource>> {
    let error = dead
        .take_error()
        .unwrap_or_else(|| "capture stream failed".to_string());
    tracing::warn!(stable_id = %ctx.stable_id, "Capture failed, attempting restart: {}", error);
    *ctx.last_error.write() = Some(error);
    dead.close();
    drop(dead);
    ctx.metrics.restart_count.fetch_add(1, Ordering::Relaxed);

    while *attempts < RESTART_BACKOFF.len() {
        let delay = RESTART_BACKOFF[*attempts];
        *attempts += 1;
        tokio::time::sleep(delay).await;
        if ctx.stop.load(Ordering::SeqCst) {
            return None;
        }
        let config = ctx.audio_config.read().clone();
        let factory = ctx.factory.clone();
        let metrics = ctx.metrics.clone();
        let reopened = tokio::task::spawn_blocking(move || factory.open(&config, metrics)).await;
        match reopened {
            Ok(Ok(source)) => {
                tracing::info!(
                    stable_id = %ctx.stable_id,
                    attempt = *attempts,
                    "Capture restarted"
                );
                *ctx.last_error.write() = None;
                return Some(source);
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    stable_id = %ctx.stable_id,
                    attempt = *attempts,
                    "Restart attempt failed: {}", e
                );
                *ctx.last_error.write() = Some(e.to_string());
            }
            Err(e) => {
                tracing::error!(stable_id = %ctx.stable_id, "Restart task failed: {}", e);
                return None;
            }
        }
    }

    tracing::error!(
        stable_id = %ctx.stable_id,
        "Capture restarts exhausted; pipeline stopping"
    );
    None
}
