use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Audio subsystem error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device not known: {stable_id}")]
    DeviceUnknown { stable_id: String },

    #[error("Pipeline busy: {stable_id} is {state}")]
    PipelineBusy { stable_id: String, state: String },

    #[error("Concurrent device limit reached ({limit})")]
    DeviceLimit { limit: usize },

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {name:?}")]
    DeviceNotFound { name: Option<String> },

    #[error("Device busy: {name}")]
    DeviceBusy { name: String },

    #[error("Sample rate {rate} Hz not supported by {name}")]
    UnsupportedRate { name: String, rate: u32 },

    #[error("Device disconnected")]
    DeviceDisconnected,

    #[error("Format not supported: {format}")]
    FormatNotSupported { format: String },

    #[error("No audio data for {duration:?}")]
    NoDataTimeout { duration: Duration },

    #[error("CPAL error: {0}")]
    Cpal(#[from] cpal::StreamError),

    #[error("Build stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Play stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Supported stream configs error: {0}")]
    SupportedStreamConfigs(#[from] cpal::SupportedStreamConfigsError),

    #[error("Fatal error, cannot recover: {0}")]
    Fatal(String),
}

/// Synchronous rejection of a config field, naming the accepted range.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid value for `{field}`: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Backoff schedule for transient capture failures. Exhausting it
/// parks the pipeline with its last error recorded.
pub const RESTART_BACKOFF: &[Duration] = &[
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];
