use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, Stream, StreamConfig};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sonoscope_foundation::{AudioConfig, AudioError};
use sonoscope_telemetry::{FpsTracker, PipelineMetrics};

use crate::device::{negotiate_rate, DeviceSelector};
use crate::ring_buffer::SampleProducer;
use crate::watchdog::WatchdogTimer;

/// How long a stream may go silent before the watchdog trips.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);
/// Workers must wind down within this budget before being detached.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// What the capture thread actually opened.
#[derive(Debug, Clone)]
pub struct NegotiatedInput {
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Dedicated OS thread owning the cpal input stream. Mono blocks
/// (channel 0) land in the SPSC ring; a full ring drops the block and
/// counts an overrun. Stream death is reported through the failure
/// flag, never handled here: restarts are the pipeline supervisor's
/// call.
pub struct CaptureThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    negotiated: NegotiatedInput,
}

impl CaptureThread {
    pub fn spawn(
        config: AudioConfig,
        producer: SampleProducer,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, AudioError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None::<String>));
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<NegotiatedInput, AudioError>>(1);

        let thread_shutdown = shutdown.clone();
        let thread_failed = failed.clone();
        let thread_error = last_error.clone();

        let handle = thread::Builder::new()
            .name("sonoscope-capture".to_string())
            .spawn(move || {
                run_capture(
                    config,
                    producer,
                    metrics,
                    open_tx,
                    thread_shutdown,
                    thread_failed,
                    thread_error,
                );
            })
            .map_err(|e| AudioError::Fatal(format!("Failed to spawn capture thread: {}", e)))?;

        let negotiated = match open_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                return Err(AudioError::Fatal(
                    "Capture thread did not report within timeout".to_string(),
                ));
            }
        };

        Ok(Self {
            handle: Some(handle),
            shutdown,
            failed,
            last_error,
            negotiated,
        })
    }

    pub fn negotiated(&self) -> &NegotiatedInput {
        &self.negotiated
    }

    /// True once the stream has died (error callback or watchdog). The
    /// thread has already torn the stream down by then.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Stop the thread, waiting up to the grace period before detaching.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + STOP_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("Capture thread did not stop within grace period; detaching");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_capture(
    config: AudioConfig,
    producer: SampleProducer,
    metrics: Arc<PipelineMetrics>,
    open_tx: crossbeam_channel::Sender<Result<NegotiatedInput, AudioError>>,
    shutdown: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let watchdog = WatchdogTimer::new(WATCHDOG_TIMEOUT);
    let stream_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let opened = open_stream(
        &config,
        producer,
        metrics,
        watchdog.clone(),
        stream_error.clone(),
    );
    let (stream, negotiated) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(map_play_error(e)));
        return;
    }
    watchdog.arm();
    let _ = open_tx.send(Ok(negotiated.clone()));
    tracing::info!(
        device = %negotiated.device_name,
        sample_rate = negotiated.sample_rate,
        channels = negotiated.channels,
        "Capture stream running"
    );

    while !shutdown.load(Ordering::SeqCst) {
        if let Some(err) = stream_error.lock().take() {
            tracing::warn!("Capture stream error: {}", err);
            *last_error.lock() = Some(err);
            failed.store(true, Ordering::SeqCst);
            break;
        }
        if watchdog.check() {
            *last_error.lock() = Some(format!(
                "no audio callbacks for {:?}",
                WATCHDOG_TIMEOUT
            ));
            failed.store(true, Ordering::SeqCst);
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    watchdog.disarm();
    tracing::debug!("Capture thread exited");
}

fn open_stream(
    config: &AudioConfig,
    producer: SampleProducer,
    metrics: Arc<PipelineMetrics>,
    watchdog: WatchdogTimer,
    stream_error: Arc<Mutex<Option<String>>>,
) -> Result<(Stream, NegotiatedInput), AudioError> {
    let selector = DeviceSelector::new();
    let device = selector.open(&config.device_names)?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let (channels, sample_format) = negotiate_rate(&device, config.sample_rate)?;

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.block_size as u32),
    };

    let negotiated = NegotiatedInput {
        device_name: device_name.clone(),
        sample_rate: config.sample_rate,
        channels,
    };

    let producer = Arc::new(Mutex::new(producer));
    let fps_tracker = Arc::new(Mutex::new(FpsTracker::new()));
    let err_fn = {
        let stream_error = stream_error.clone();
        move |err: cpal::StreamError| {
            *stream_error.lock() = Some(err.to_string());
        }
    };

    // Shared path once the callback data is mono f32: feed the watchdog,
    // push into the ring, count the block or the overrun.
    let handle_block = move |mono: &[f32]| {
        watchdog.feed();
        if producer.lock().write(mono).is_ok() {
            metrics.record_block(mono.len());
            if let Some(fps) = fps_tracker.lock().tick() {
                metrics.update_capture_fps(fps);
            }
        } else {
            metrics.record_overrun();
        }
    };

    // Channel 0 only; scratch buffers are thread-local so the audio
    // callback never allocates.
    thread_local! {
        static MONO_BUFFER: std::cell::RefCell<Vec<f32>> = const { std::cell::RefCell::new(Vec::new()) };
    }

    let ch = channels as usize;
    let stream = match sample_format {
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &_| {
                    MONO_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        mono.clear();
                        mono.reserve(data.len() / ch);
                        for frame in data.chunks_exact(ch) {
                            mono.push(frame[0]);
                        }
                        handle_block(&mono);
                    });
                },
                err_fn,
                None,
            )
            .map_err(map_build_error)?,
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &_| {
                    MONO_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        mono.clear();
                        mono.reserve(data.len() / ch);
                        for frame in data.chunks_exact(ch) {
                            mono.push(frame[0] as f32 / 32_768.0);
                        }
                        handle_block(&mono);
                    });
                },
                err_fn,
                None,
            )
            .map_err(map_build_error)?,
        SampleFormat::U16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[u16], _: &_| {
                    MONO_BUFFER.with(|buf| {
                        let mut mono = buf.borrow_mut();
                        mono.clear();
                        mono.reserve(data.len() / ch);
                        for frame in data.chunks_exact(ch) {
                            mono.push((frame[0] as i32 - 32_768) as f32 / 32_768.0);
                        }
                        handle_block(&mono);
                    });
                },
                err_fn,
                None,
            )
            .map_err(map_build_error)?,
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{:?}", other),
            });
        }
    };

    Ok((stream, negotiated))
}

fn map_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => AudioError::DeviceBusy {
            name: "input".to_string(),
        },
        other => AudioError::BuildStream(other),
    }
}

fn map_play_error(e: cpal::PlayStreamError) -> AudioError {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => AudioError::DeviceBusy {
            name: "input".to_string(),
        },
        other => AudioError::PlayStream(other),
    }
}
