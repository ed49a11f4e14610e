use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Detects a capture stream that silently stops delivering callbacks.
/// The capture thread feeds it from the audio callback; the supervisor
/// polls `is_triggered` and treats a trip as a transient I/O failure.
#[derive(Clone)]
pub struct WatchdogTimer {
    timeout: Duration,
    last_feed: Arc<RwLock<Option<Instant>>>,
    triggered: Arc<AtomicBool>,
}

impl WatchdogTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_feed: Arc::new(RwLock::new(None)),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn arm(&self) {
        *self.last_feed.write() = Some(Instant::now());
        self.triggered.store(false, Ordering::SeqCst);
    }

    pub fn feed(&self) {
        *self.last_feed.write() = Some(Instant::now());
    }

    /// Checked from the capture thread's supervision loop.
    pub fn check(&self) -> bool {
        let elapsed = {
            let guard = self.last_feed.read();
            guard.map(|last| last.elapsed())
        };
        if let Some(elapsed) = elapsed {
            if elapsed > self.timeout && !self.triggered.load(Ordering::SeqCst) {
                tracing::error!("Watchdog timeout: no audio data for {:?}", elapsed);
                self.triggered.store(true, Ordering::SeqCst);
            }
        }
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn disarm(&self) {
        self.triggered.store(false, Ordering::SeqCst);
        *self.last_feed.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_trigger_before_timeout() {
        let wd = WatchdogTimer::new(Duration::from_secs(5));
        wd.arm();
        assert!(!wd.check());
    }

    #[test]
    fn triggers_after_timeout() {
        let wd = WatchdogTimer::new(Duration::from_millis(10));
        wd.arm();
        std::thread::sleep(Duration::from_millis(30));
        assert!(wd.check());
        assert!(wd.is_triggered());
    }

    #[test]
    fn disarmed_watchdog_never_triggers() {
        let wd = WatchdogTimer::new(Duration::from_millis(1));
        wd.disarm();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!wd.check());
    }
}
