use std::collections::VecDeque;
use std::time::{Duration, Instant};

use sonoscope_foundation::{real_clock, SharedClock, StreamConfig};

use crate::frame::SpectrumFrame;

/// Why a candidate frame was not emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Peak magnitude under the frame-level silence gate.
    Magnitude,
    /// Too similar to the last emitted spectrum.
    Similarity,
    /// Emitting now would exceed the effective target FPS.
    Pacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Emit,
    Skip(SkipReason),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SkipCounts {
    pub magnitude: u64,
    pub similarity: u64,
    pub pacing: u64,
}

/// Decides, for every candidate spectrum, whether it goes out. Three
/// gates compose in order: magnitude, similarity, FPS pacing. The
/// throttler itself never fails; invalid configs are rejected upstream
/// at config-apply time.
pub struct StreamThrottler {
    config: StreamConfig,
    clock: SharedClock,
    effective_fps: f64,
    last_emitted_spectrum: Option<Vec<f32>>,
    last_emitted_sequence: u64,
    last_emit_at: Option<Instant>,
    /// EWMA of the producer-wait time in seconds, fed by the pipeline.
    wait_ewma_s: f64,
    last_adjust_at: Instant,
    emit_window: VecDeque<Instant>,
    skips: SkipCounts,
}

const WAIT_EWMA_ALPHA: f64 = 0.2;
const ADJUST_INTERVAL: Duration = Duration::from_secs(1);
/// Saturated: producer-wait under 10% of the frame interval.
const SATURATION_RATIO: f64 = 0.1;
/// Slack: producer-wait above 50% of the frame interval.
const SLACK_RATIO: f64 = 0.5;
/// Bounded step, up or down, per adjustment.
const FPS_STEP: f64 = 0.1;

impl StreamThrottler {
    pub fn new(config: StreamConfig) -> Self {
        Self::with_clock(config, real_clock())
    }

    pub fn with_clock(config: StreamConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            effective_fps: config.target_fps as f64,
            config,
            clock,
            last_emitted_spectrum: None,
            last_emitted_sequence: 0,
            last_emit_at: None,
            wait_ewma_s: 0.0,
            last_adjust_at: now,
            emit_window: VecDeque::new(),
            skips: SkipCounts::default(),
        }
    }

    /// Apply a hot config update. The effective rate is re-anchored to
    /// the new target and bounds.
    pub fn update_config(&mut self, config: StreamConfig) {
        self.config = config;
        if config.enable_adaptive_fps {
            self.effective_fps = self
                .effective_fps
                .clamp(config.min_fps as f64, config.max_fps as f64);
        } else {
            self.effective_fps = config.target_fps as f64;
        }
    }

    /// Record how long the processor waited on the audio source before
    /// this frame. Drives the adaptive FPS loop.
    pub fn observe_producer_wait(&mut self, wait: Duration) {
        self.wait_ewma_s =
            WAIT_EWMA_ALPHA * wait.as_secs_f64() + (1.0 - WAIT_EWMA_ALPHA) * self.wait_ewma_s;
    }

    pub fn decide(&mut self, frame: &SpectrumFrame) -> ThrottleDecision {
        let now = self.clock.now();
        self.maybe_adjust_fps(now);

        // 1) Magnitude gate: silence produces no interesting frames.
        if frame.peak_magnitude_db < self.config.magnitude_threshold_db {
            self.skips.magnitude += 1;
            return ThrottleDecision::Skip(SkipReason::Magnitude);
        }

        // 2) Similarity skip against the last *emitted* spectrum.
        if self.config.enable_smart_skip {
            if let Some(last) = &self.last_emitted_spectrum {
                let similarity = cosine_similarity(&frame.magnitudes_db, last);
                if similarity >= self.config.similarity_threshold {
                    self.skips.similarity += 1;
                    return ThrottleDecision::Skip(SkipReason::Similarity);
                }
            }
        }

        // 3) Target-FPS pacing.
        if let Some(last) = self.last_emit_at {
            let min_interval = Duration::from_secs_f64(1.0 / self.effective_fps);
            if now.duration_since(last) < min_interval {
                self.skips.pacing += 1;
                return ThrottleDecision::Skip(SkipReason::Pacing);
            }
        }

        self.record_emit(frame, now);
        ThrottleDecision::Emit
    }

    fn record_emit(&mut self, frame: &SpectrumFrame, now: Instant) {
        self.last_emitted_spectrum = Some(frame.magnitudes_db.clone());
        self.last_emitted_sequence = frame.sequence_id;
        self.last_emit_at = Some(now);
        self.emit_window.push_back(now);
        self.trim_window(now);
    }

    fn maybe_adjust_fps(&mut self, now: Instant) {
        if !self.config.enable_adaptive_fps {
            self.effective_fps = self.config.target_fps as f64;
            return;
        }
        if now.duration_since(self.last_adjust_at) < ADJUST_INTERVAL {
            return;
        }
        self.last_adjust_at = now;

        let frame_interval = 1.0 / self.effective_fps;
        let ratio = self.wait_ewma_s / frame_interval;
        let adjusted = if ratio < SATURATION_RATIO {
            self.effective_fps * (1.0 - FPS_STEP)
        } else if ratio > SLACK_RATIO {
            self.effective_fps * (1.0 + FPS_STEP)
        } else {
            return;
        };
        let bounded = adjusted.clamp(self.config.min_fps as f64, self.config.max_fps as f64);
        if (bounded - self.effective_fps).abs() > f64::EPSILON {
            tracing::debug!(
                from = self.effective_fps,
                to = bounded,
                wait_ratio = ratio,
                "adaptive fps adjustment"
            );
            self.effective_fps = bounded;
        }
    }

    fn trim_window(&mut self, now: Instant) {
        while let Some(&front) = self.emit_window.front() {
            if now.duration_since(front) > Duration::from_secs(1) {
                self.emit_window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Emissions over the trailing one-second window.
    pub fn observed_fps(&mut self) -> f64 {
        let now = self.clock.now();
        self.trim_window(now);
        self.emit_window.len() as f64
    }

    pub fn effective_target_fps(&self) -> f64 {
        self.effective_fps
    }

    pub fn last_emitted_sequence(&self) -> u64 {
        self.last_emitted_sequence
    }

    pub fn skip_counts(&self) -> SkipCounts {
        self.skips
    }
}

/// Cosine similarity over the clamped dB vectors. Zero-norm inputs
/// report 0 so a degenerate frame is emitted rather than skipped.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonoscope_foundation::TestClock;
    use std::sync::Arc;

    fn frame(seq: u64, peak_db: f32, mags: Vec<f32>) -> SpectrumFrame {
        SpectrumFrame {
            sequence_id: seq,
            timestamp_ms: 0,
            sample_rate: 48_000,
            fft_size: mags.len() * 2,
            bins_count: mags.len(),
            peak_magnitude_db: peak_db,
            peak_frequency_hz: 1_000.0,
            spl_db: 40.0,
            magnitudes_db: mags,
            fps: 0.0,
        }
    }

    fn throttler(config: StreamConfig) -> (StreamThrottler, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        (StreamThrottler::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn silent_frames_fail_magnitude_gate() {
        let (mut t, _clock) = throttler(StreamConfig::default());
        let f = frame(1, -100.0, vec![-100.0; 16]);
        assert_eq!(t.decide(&f), ThrottleDecision::Skip(SkipReason::Magnitude));
        assert_eq!(t.skip_counts().magnitude, 1);
        assert_eq!(t.last_emitted_sequence(), 0);
    }

    #[test]
    fn identical_frames_are_skipped_by_similarity() {
        let config = StreamConfig {
            similarity_threshold: 0.99,
            enable_smart_skip: true,
            enable_adaptive_fps: false,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        let mags: Vec<f32> = (0..64).map(|i| -60.0 + i as f32).collect();
        assert_eq!(t.decide(&frame(1, -10.0, mags.clone())), ThrottleDecision::Emit);
        for seq in 2..10 {
            clock.advance(Duration::from_millis(100));
            assert_eq!(
                t.decide(&frame(seq, -10.0, mags.clone())),
                ThrottleDecision::Skip(SkipReason::Similarity)
            );
        }
        assert_eq!(t.skip_counts().similarity, 8);
    }

    #[test]
    fn smart_skip_can_be_disabled() {
        let config = StreamConfig {
            enable_smart_skip: false,
            enable_adaptive_fps: false,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        let mags: Vec<f32> = vec![-50.0; 64];
        assert_eq!(t.decide(&frame(1, -10.0, mags.clone())), ThrottleDecision::Emit);
        clock.advance(Duration::from_millis(100));
        assert_eq!(t.decide(&frame(2, -10.0, mags)), ThrottleDecision::Emit);
    }

    #[test]
    fn pacing_enforces_target_fps() {
        let config = StreamConfig {
            target_fps: 10,
            enable_smart_skip: false,
            enable_adaptive_fps: false,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        assert_eq!(t.decide(&frame(1, -10.0, vec![-50.0; 8])), ThrottleDecision::Emit);
        clock.advance(Duration::from_millis(50));
        assert_eq!(
            t.decide(&frame(2, -10.0, vec![-40.0; 8])),
            ThrottleDecision::Skip(SkipReason::Pacing)
        );
        clock.advance(Duration::from_millis(60));
        assert_eq!(t.decide(&frame(3, -10.0, vec![-30.0; 8])), ThrottleDecision::Emit);
        assert_eq!(t.last_emitted_sequence(), 3);
        assert_eq!(t.skip_counts().pacing, 1);
    }

    #[test]
    fn saturation_lowers_effective_fps() {
        let config = StreamConfig {
            target_fps: 30,
            min_fps: 5,
            max_fps: 60,
            enable_smart_skip: false,
            enable_adaptive_fps: true,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        // Saturated: producer never waits.
        for _ in 0..20 {
            t.observe_producer_wait(Duration::ZERO);
        }
        clock.advance(Duration::from_millis(1100));
        let _ = t.decide(&frame(1, -10.0, vec![-50.0; 8]));
        assert!(t.effective_target_fps() < 30.0);
        assert!((t.effective_target_fps() - 27.0).abs() < 1e-6);
    }

    #[test]
    fn slack_raises_effective_fps_up_to_max() {
        let config = StreamConfig {
            target_fps: 58,
            min_fps: 5,
            max_fps: 60,
            enable_smart_skip: false,
            enable_adaptive_fps: true,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        for _ in 0..50 {
            t.observe_producer_wait(Duration::from_millis(30));
        }
        clock.advance(Duration::from_millis(1100));
        let _ = t.decide(&frame(1, -10.0, vec![-50.0; 8]));
        // +10% of 58 clamps to the configured max.
        assert_eq!(t.effective_target_fps(), 60.0);
    }

    #[test]
    fn adaptive_disabled_pins_target() {
        let config = StreamConfig {
            target_fps: 30,
            enable_adaptive_fps: false,
            enable_smart_skip: false,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        t.observe_producer_wait(Duration::ZERO);
        clock.advance(Duration::from_secs(2));
        let _ = t.decide(&frame(1, -10.0, vec![-50.0; 8]));
        assert_eq!(t.effective_target_fps(), 30.0);
    }

    #[test]
    fn observed_fps_counts_one_second_window() {
        let config = StreamConfig {
            target_fps: 120,
            enable_smart_skip: false,
            enable_adaptive_fps: false,
            ..Default::default()
        };
        let (mut t, clock) = throttler(config);
        for seq in 1..=5 {
            let mags = vec![-50.0 - seq as f32; 8];
            assert_eq!(t.decide(&frame(seq, -10.0, mags)), ThrottleDecision::Emit);
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(t.observed_fps(), 5.0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(t.observed_fps(), 0.0);
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        let b = vec![-1.0, -2.0, -3.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }
}
