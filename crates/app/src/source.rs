use std::sync::Arc;

use sonoscope_audio::{BlockReader, CaptureThread, SampleRing};
use sonoscope_foundation::{AudioConfig, AudioError};
use sonoscope_telemetry::PipelineMetrics;

/// A running producer of mono f32 blocks. The real implementation is
/// a cpal capture thread; tests substitute synthetic sources to drive
/// the pipeline deterministically.
pub trait BlockSource: Send {
    /// Non-blocking: up to `max_samples` if any are buffered.
    fn read_block(&mut self, max_samples: usize) -> Option<Vec<f32>>;
    /// The source has died and will produce no more data.
    fn is_failed(&self) -> bool;
    fn take_error(&mut self) -> Option<String>;
    fn close(&mut self);
}

/// Opens block sources. The pipeline holds one so auto-restarts can
/// re-open the device with the same selection rules.
pub trait SourceFactory: Send + Sync {
    fn open(
        &self,
        config: &AudioConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Box<dyn BlockSource>, AudioError>;
}

/// Production factory: cpal capture thread feeding an rtrb ring.
pub struct CaptureSourceFactory;

impl SourceFactory for CaptureSourceFactory {
    fn open(
        &self,
        config: &AudioConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Box<dyn BlockSource>, AudioError> {
        // Room for several callback blocks; overruns past this are
        // dropped at the producer with a counter increment.
        let capacity = (config.block_size * 8).max(config.fft_size * 2);
        let (producer, consumer) = SampleRing::new(capacity).split();
        let capture = CaptureThread::spawn(config.clone(), producer, metrics)?;
        Ok(Box::new(CaptureSource {
            reader: BlockReader::new(consumer),
            capture: Some(capture),
        }))
    }
}

struct CaptureSource {
    reader: BlockReader,
    capture: Option<CaptureThread>,
}

impl BlockSource for CaptureSource {
    fn read_block(&mut self, max_samples: usize) -> Option<Vec<f32>> {
        self.reader.read_block(max_samples)
    }

    fn is_failed(&self) -> bool {
        self.capture.as_ref().map(|c| c.is_failed()).unwrap_or(true)
    }

    fn take_error(&mut self) -> Option<String> {
        self.capture.as_ref().and_then(|c| c.last_error())
    }

    fn close(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}
