/// One short-time spectrum produced by the processor, before encoding.
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    /// Strictly increasing per pipeline, starting at 1. Gaps in the
    /// emitted stream mean the throttler skipped frames.
    pub sequence_id: u64,
    /// Wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub bins_count: usize,
    /// dB magnitudes, clamped at the configured noise floor.
    pub magnitudes_db: Vec<f32>,
    pub peak_frequency_hz: f32,
    pub peak_magnitude_db: f32,
    /// Uncalibrated energy sum over the unclamped bins.
    pub spl_db: f32,
    /// Observed emission rate, filled in at publish time.
    pub fps: f32,
}

pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
