use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use sonoscope_foundation::{ConfigError, WindowKind};

use crate::frame::{epoch_millis, SpectrumFrame};
use crate::window;

/// Floor inside the log to keep silence finite.
const LOG_EPSILON: f32 = 1e-10;
/// Fixed compensation for window attenuation. Part of the wire
/// contract: downstream SPL calibration assumes it.
const WINDOW_COMPENSATION_DB: f32 = 6.0;

/// Stateful block-to-spectrum transformer. Buffers incoming mono f32
/// blocks, emits one dB spectrum per `fft_size` window, advancing by
/// `fft_size * (1 - overlap)` samples between windows.
pub struct SpectrumProcessor {
    sample_rate: u32,
    fft_size: usize,
    hop_size: usize,
    overlap: f32,
    window_kind: WindowKind,
    threshold_db: f32,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    buffer: VecDeque<f32>,
    next_sequence: u64,
    frames_produced: u64,
}

impl SpectrumProcessor {
    pub fn new(
        sample_rate: u32,
        fft_size: usize,
        overlap: f32,
        window_kind: WindowKind,
        threshold_db: f32,
    ) -> Result<Self, ConfigError> {
        if !fft_size.is_power_of_two() || !(256..=65_536).contains(&fft_size) {
            return Err(ConfigError::new(
                "fft_size",
                format!("{} is not a power of two in 256..=65536", fft_size),
            ));
        }
        if !(0.0..=0.9).contains(&overlap) {
            return Err(ConfigError::new(
                "overlap",
                format!("{} outside accepted range 0.0..=0.9", overlap),
            ));
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        Ok(Self {
            sample_rate,
            fft_size,
            hop_size: hop(fft_size, overlap),
            overlap,
            window_kind,
            threshold_db,
            window: window::coefficients(window_kind, fft_size),
            fft,
            fft_scratch: vec![Complex::default(); scratch_len],
            buffer: VecDeque::with_capacity(fft_size * 2),
            next_sequence: 0,
            frames_produced: 0,
        })
    }

    /// Feed a block of mono samples; returns zero or more spectra
    /// depending on how many full windows are now available.
    pub fn push(&mut self, block: &[f32]) -> Vec<SpectrumFrame> {
        self.buffer.extend(block.iter().copied());

        // Cap buffered backlog at two windows, like the capture ring:
        // older samples are stale once we fall behind.
        let cap = self.fft_size * 2;
        while self.buffer.len() > cap {
            self.buffer.pop_front();
        }

        let mut out = Vec::new();
        while self.buffer.len() >= self.fft_size {
            out.push(self.process_window());
            for _ in 0..self.hop_size {
                if self.buffer.pop_front().is_none() {
                    break;
                }
            }
        }
        out
    }

    fn process_window(&mut self) -> SpectrumFrame {
        let mut input: Vec<Complex<f32>> = self
            .buffer
            .iter()
            .take(self.fft_size)
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process_with_scratch(&mut input, &mut self.fft_scratch);

        let bins = self.fft_size / 2;
        let scale = self.fft_size as f32;
        let mut magnitudes_db = Vec::with_capacity(bins);
        // SPL is an energy sum over the raw magnitudes; it must not see
        // the noise-floor clamp applied below.
        let mut energy = 0.0f32;
        for bin in input.iter().take(bins) {
            let db = 20.0 * (bin.norm() / scale + LOG_EPSILON).log10() + WINDOW_COMPENSATION_DB;
            energy += 10.0f32.powf(db / 10.0);
            magnitudes_db.push(db.max(self.threshold_db));
        }
        let spl_db = 10.0 * energy.log10();

        let (peak_idx, peak_magnitude_db) = magnitudes_db
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |(bi, bm), (i, &m)| {
                if m > bm {
                    (i, m)
                } else {
                    (bi, bm)
                }
            });
        let peak_frequency_hz = peak_idx as f32 * self.sample_rate as f32 / self.fft_size as f32;

        self.next_sequence += 1;
        self.frames_produced += 1;

        SpectrumFrame {
            sequence_id: self.next_sequence,
            timestamp_ms: epoch_millis(),
            sample_rate: self.sample_rate,
            fft_size: self.fft_size,
            bins_count: bins,
            magnitudes_db,
            peak_frequency_hz,
            peak_magnitude_db,
            spl_db,
            fps: 0.0,
        }
    }

    /// Hot reconfiguration: next window picks up the new coefficients.
    pub fn set_window_kind(&mut self, kind: WindowKind) {
        if kind != self.window_kind {
            self.window_kind = kind;
            self.window = window::coefficients(kind, self.fft_size);
        }
    }

    pub fn set_threshold_db(&mut self, threshold_db: f32) {
        self.threshold_db = threshold_db;
    }

    pub fn set_overlap(&mut self, overlap: f32) -> Result<(), ConfigError> {
        if !(0.0..=0.9).contains(&overlap) {
            return Err(ConfigError::new(
                "overlap",
                format!("{} outside accepted range 0.0..=0.9", overlap),
            ));
        }
        self.overlap = overlap;
        self.hop_size = hop(self.fft_size, overlap);
        Ok(())
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    pub fn frequency_resolution_hz(&self) -> f32 {
        self.sample_rate as f32 / self.fft_size as f32
    }
}

fn hop(fft_size: usize, overlap: f32) -> usize {
    ((fft_size as f32 * (1.0 - overlap)) as usize).max(1)
}
