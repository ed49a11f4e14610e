use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Window function applied before the FFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Hann,
    Hamming,
    Blackman,
    Rectangular,
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::Hann
    }
}

impl std::str::FromStr for WindowKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hann" => Ok(WindowKind::Hann),
            "hamming" => Ok(WindowKind::Hamming),
            "blackman" => Ok(WindowKind::Blackman),
            "rectangular" => Ok(WindowKind::Rectangular),
            other => Err(ConfigError::new(
                "window",
                format!("unknown window `{}` (hann, hamming, blackman, rectangular)", other),
            )),
        }
    }
}

/// Capture-side configuration. Every field except `window`, `overlap`
/// requires re-opening the audio stream to take effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Preferred device name substrings, tried in order before the host default.
    pub device_names: Vec<String>,
    pub sample_rate: u32,
    pub block_size: usize,
    pub fft_size: usize,
    pub window: WindowKind,
    pub overlap: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_names: vec![
                "UltraMic384K".to_string(),
                "UltraMic".to_string(),
                "384K".to_string(),
            ],
            sample_rate: 384_000,
            block_size: 3_840,
            fft_size: 8_192,
            window: WindowKind::Hann,
            overlap: 0.75,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::new("sample_rate", "must be a positive Hz value"));
        }
        if !self.fft_size.is_power_of_two() || !(256..=65_536).contains(&self.fft_size) {
            return Err(ConfigError::new(
                "fft_size",
                format!("{} is not a power of two in 256..=65536", self.fft_size),
            ));
        }
        if self.block_size == 0 {
            return Err(ConfigError::new("block_size", "must be positive"));
        }
        if !(0.0..=0.9).contains(&self.overlap) {
            return Err(ConfigError::new(
                "overlap",
                format!("{} outside accepted range 0.0..=0.9", self.overlap),
            ));
        }
        Ok(())
    }

    /// Samples the analysis window advances between FFTs.
    pub fn hop_size(&self) -> usize {
        let hop = (self.fft_size as f32 * (1.0 - self.overlap)) as usize;
        hop.max(1)
    }
}

/// Streaming-side configuration. All fields are hot-applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub target_fps: u32,
    pub compression_level: u32,
    /// Frame-level silence gate: frames whose peak is below this are skipped.
    pub magnitude_threshold_db: f32,
    /// Per-bin noise floor clamp applied to emitted magnitudes.
    pub threshold_db: f32,
    pub similarity_threshold: f32,
    pub enable_smart_skip: bool,
    pub enable_adaptive_fps: bool,
    pub min_fps: u32,
    pub max_fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            compression_level: 6,
            magnitude_threshold_db: -80.0,
            threshold_db: -100.0,
            similarity_threshold: 0.95,
            enable_smart_skip: true,
            enable_adaptive_fps: true,
            min_fps: 5,
            max_fps: 60,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=120).contains(&self.target_fps) {
            return Err(ConfigError::new(
                "target_fps",
                format!("{} outside accepted range 1..=120", self.target_fps),
            ));
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(ConfigError::new(
                "compression_level",
                format!("{} outside accepted gzip range 1..=9", self.compression_level),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(ConfigError::new(
                "similarity_threshold",
                format!("{} outside accepted range (0, 1]", self.similarity_threshold),
            ));
        }
        if self.min_fps == 0 || self.min_fps > self.max_fps {
            return Err(ConfigError::new(
                "min_fps",
                format!("min_fps {} must be >= 1 and <= max_fps {}", self.min_fps, self.max_fps),
            ));
        }
        if !(1..=120).contains(&self.max_fps) {
            return Err(ConfigError::new(
                "max_fps",
                format!("{} outside accepted range 1..=120", self.max_fps),
            ));
        }
        Ok(())
    }
}

/// Partial update to a [`StreamConfig`]; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfigPatch {
    pub target_fps: Option<u32>,
    pub compression_level: Option<u32>,
    pub magnitude_threshold_db: Option<f32>,
    pub threshold_db: Option<f32>,
    pub similarity_threshold: Option<f32>,
    pub enable_smart_skip: Option<bool>,
    pub enable_adaptive_fps: Option<bool>,
    pub min_fps: Option<u32>,
    pub max_fps: Option<u32>,
}

impl StreamConfigPatch {
    /// Validate against `base` and return the merged config.
    pub fn merge(&self, base: &StreamConfig) -> Result<StreamConfig, ConfigError> {
        let mut next = *base;
        if let Some(v) = self.target_fps {
            next.target_fps = v;
        }
        if let Some(v) = self.compression_level {
            next.compression_level = v;
        }
        if let Some(v) = self.magnitude_threshold_db {
            next.magnitude_threshold_db = v;
        }
        if let Some(v) = self.threshold_db {
            next.threshold_db = v;
        }
        if let Some(v) = self.similarity_threshold {
            next.similarity_threshold = v;
        }
        if let Some(v) = self.enable_smart_skip {
            next.enable_smart_skip = v;
        }
        if let Some(v) = self.enable_adaptive_fps {
            next.enable_adaptive_fps = v;
        }
        if let Some(v) = self.min_fps {
            next.min_fps = v;
        }
        if let Some(v) = self.max_fps {
            next.max_fps = v;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial update to an [`AudioConfig`]. Applying one always restarts
/// the capture stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AudioConfigPatch {
    pub device_names: Option<Vec<String>>,
    pub sample_rate: Option<u32>,
    pub block_size: Option<usize>,
    pub fft_size: Option<usize>,
    pub window: Option<WindowKind>,
    pub overlap: Option<f32>,
}

impl AudioConfigPatch {
    pub fn merge(&self, base: &AudioConfig) -> Result<AudioConfig, ConfigError> {
        let mut next = base.clone();
        if let Some(v) = &self.device_names {
            next.device_names = v.clone();
        }
        if let Some(v) = self.sample_rate {
            next.sample_rate = v;
        }
        if let Some(v) = self.block_size {
            next.block_size = v;
        }
        if let Some(v) = self.fft_size {
            next.fft_size = v;
        }
        if let Some(v) = self.window {
            next.window = v;
        }
        if let Some(v) = self.overlap {
            next.overlap = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// True when the patch touches a field that forces the stream to reopen.
    pub fn needs_restart(&self) -> bool {
        self.device_names.is_some()
            || self.sample_rate.is_some()
            || self.block_size.is_some()
            || self.fft_size.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_audio_config_is_valid() {
        AudioConfig::default().validate().unwrap();
        StreamConfig::default().validate().unwrap();
    }

    #[test]
    fn fft_size_must_be_power_of_two() {
        let cfg = AudioConfig {
            fft_size: 3000,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "fft_size");
    }

    #[test]
    fn fft_size_range_enforced() {
        let cfg = AudioConfig {
            fft_size: 128,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = AudioConfig {
            fft_size: 131_072,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overlap_range_enforced() {
        let cfg = AudioConfig {
            overlap: 0.95,
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().field, "overlap");
    }

    #[test]
    fn hop_size_honors_overlap() {
        let cfg = AudioConfig {
            fft_size: 8192,
            overlap: 0.75,
            ..Default::default()
        };
        assert_eq!(cfg.hop_size(), 2048);
        let cfg = AudioConfig {
            fft_size: 1024,
            overlap: 0.0,
            ..Default::default()
        };
        assert_eq!(cfg.hop_size(), 1024);
    }

    #[test]
    fn zero_target_fps_rejected() {
        let cfg = StreamConfig {
            target_fps: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err().field, "target_fps");
    }

    #[test]
    fn stream_patch_merges_and_validates() {
        let base = StreamConfig::default();
        let patch = StreamConfigPatch {
            target_fps: Some(15),
            ..Default::default()
        };
        let next = patch.merge(&base).unwrap();
        assert_eq!(next.target_fps, 15);
        assert_eq!(next.compression_level, base.compression_level);

        let bad = StreamConfigPatch {
            compression_level: Some(12),
            ..Default::default()
        };
        assert!(bad.merge(&base).is_err());
    }

    #[test]
    fn audio_patch_flags_restart_fields() {
        let hot = AudioConfigPatch {
            window: Some(WindowKind::Blackman),
            overlap: Some(0.5),
            ..Default::default()
        };
        assert!(!hot.needs_restart());

        let cold = AudioConfigPatch {
            sample_rate: Some(192_000),
            ..Default::default()
        };
        assert!(cold.needs_restart());
    }
}
