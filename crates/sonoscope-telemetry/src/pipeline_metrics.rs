use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared metrics for one device pipeline. Updated lock-free from the
/// audio callback and processor task, read by status endpoints.
#[derive(Clone)]
pub struct PipelineMetrics {
    // Capture side
    pub blocks_captured: Arc<AtomicU64>,
    pub bytes_captured: Arc<AtomicU64>,
    /// Blocks dropped because the capture ring was full. The only place
    /// in the pipeline where data loss is tolerated.
    pub overruns: Arc<AtomicU64>,
    pub last_block_time: Arc<RwLock<Option<Instant>>>,

    // Processing side
    pub frames_processed: Arc<AtomicU64>,
    pub frames_emitted: Arc<AtomicU64>,

    // Throttle skip counters, by reason
    pub skipped_magnitude: Arc<AtomicU64>,
    pub skipped_similarity: Arc<AtomicU64>,
    pub skipped_pacing: Arc<AtomicU64>,

    // Rates (stored as fps * 10 for one decimal of precision)
    pub capture_fps: Arc<AtomicU64>,
    pub emit_fps: Arc<AtomicU64>,

    // Supervision
    pub restart_count: Arc<AtomicU64>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            blocks_captured: Arc::new(AtomicU64::new(0)),
            bytes_captured: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
            last_block_time: Arc::new(RwLock::new(None)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            frames_emitted: Arc::new(AtomicU64::new(0)),
            skipped_magnitude: Arc::new(AtomicU64::new(0)),
            skipped_similarity: Arc::new(AtomicU64::new(0)),
            skipped_pacing: Arc::new(AtomicU64::new(0)),
            capture_fps: Arc::new(AtomicU64::new(0)),
            emit_fps: Arc::new(AtomicU64::new(0)),
            restart_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl PipelineMetrics {
    pub fn record_block(&self, samples: usize) {
        self.blocks_captured.fetch_add(1, Ordering::Relaxed);
        self.bytes_captured
            .fetch_add((samples * 4) as u64, Ordering::Relaxed);
        *self.last_block_time.write() = Some(Instant::now());
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_capture_fps(&self, fps: f64) {
        self.capture_fps.store((fps * 10.0) as u64, Ordering::Relaxed);
    }

    pub fn update_emit_fps(&self, fps: f64) {
        self.emit_fps.store((fps * 10.0) as u64, Ordering::Relaxed);
    }

    pub fn observed_emit_fps(&self) -> f64 {
        self.emit_fps.load(Ordering::Relaxed) as f64 / 10.0
    }

    /// Duration since the capture callback last delivered a block.
    pub fn block_age(&self) -> Option<Duration> {
        self.last_block_time.read().map(|t| t.elapsed())
    }
}

/// Counts events over sliding one-second windows.
#[derive(Debug)]
pub struct FpsTracker {
    last_update: Instant,
    frame_count: u64,
}

impl FpsTracker {
    pub fn new() -> Self {
        Self {
            last_update: Instant::now(),
            frame_count: 0,
        }
    }

    /// Returns the measured rate once per second, `None` in between.
    pub fn tick(&mut self) -> Option<f64> {
        self.frame_count += 1;
        let elapsed = self.last_update.elapsed();

        if elapsed >= Duration::from_secs(1) {
            let fps = self.frame_count as f64 / elapsed.as_secs_f64();
            self.last_update = Instant::now();
            self.frame_count = 0;
            Some(fps)
        } else {
            None
        }
    }
}

impl Default for FpsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_block_updates_counters() {
        let m = PipelineMetrics::default();
        m.record_block(3840);
        m.record_block(3840);
        assert_eq!(m.blocks_captured.load(Ordering::Relaxed), 2);
        assert_eq!(m.bytes_captured.load(Ordering::Relaxed), 2 * 3840 * 4);
        assert!(m.block_age().is_some());
    }

    #[test]
    fn fps_is_stored_with_one_decimal() {
        let m = PipelineMetrics::default();
        m.update_emit_fps(29.7);
        assert_eq!(m.observed_emit_fps(), 29.7);
    }

    #[test]
    fn fps_tracker_reports_after_a_second() {
        let mut tracker = FpsTracker::new();
        assert!(tracker.tick().is_none());
        tracker.last_update = Instant::now() - Duration::from_secs(1);
        let fps = tracker.tick().unwrap();
        assert!(fps >= 1.0);
    }
}
