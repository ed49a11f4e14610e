use std::path::PathBuf;

use sonoscope_foundation::{AudioConfig, ConfigError, StreamConfig, WindowKind};

use crate::manager::ManagerConfig;

/// Server configuration assembled from the environment. Parsing lives
/// here at the edge; the core only ever sees explicit config values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub manager: ManagerConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let audio = AudioConfig {
            device_names: env_list("DEVICE_NAMES")
                .unwrap_or_else(|| AudioConfig::default().device_names),
            sample_rate: env_parse("SAMPLE_RATE", 384_000)?,
            block_size: env_parse("BLOCKSIZE", 3_840)?,
            fft_size: env_parse("FFT_SIZE", 8_192)?,
            window: env_window("WINDOW_TYPE")?,
            overlap: env_parse("OVERLAP", 0.75)?,
        };
        audio.validate()?;

        let stream = StreamConfig {
            target_fps: env_parse("TARGET_FPS", 30)?,
            compression_level: env_parse("COMPRESSION_LEVEL", 6)?,
            magnitude_threshold_db: env_parse("MAGNITUDE_THRESHOLD", -80.0)?,
            threshold_db: env_parse("THRESHOLD_DB", -100.0)?,
            similarity_threshold: env_parse("SIMILARITY_THRESHOLD", 0.95)?,
            enable_smart_skip: env_flag("SMART_SKIP", true),
            enable_adaptive_fps: env_flag("ADAPTIVE_FPS", true),
            min_fps: env_parse("MIN_FPS", 5)?,
            max_fps: env_parse("MAX_FPS", 60)?,
        };
        stream.validate()?;

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8380)?,
            manager: ManagerConfig {
                data_dir: PathBuf::from(
                    std::env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string()),
                ),
                audio_defaults: audio,
                stream_defaults: stream,
                max_running: env_parse("MAX_DEVICES", 8)?,
            },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::new(key, format!("`{}` is not a valid value", raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn env_window(key: &'static str) -> Result<WindowKind, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse(),
        Err(_) => Ok(WindowKind::Hann),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other.
    #[test]
    fn env_round_trip() {
        std::env::set_var("TARGET_FPS", "15");
        std::env::set_var("DEVICE_NAMES", "UltraMic, Dodotronic ,");
        std::env::set_var("WINDOW_TYPE", "blackman");
        std::env::set_var("SMART_SKIP", "false");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 8380);
        assert_eq!(config.manager.stream_defaults.target_fps, 15);
        assert!(!config.manager.stream_defaults.enable_smart_skip);
        assert_eq!(
            config.manager.audio_defaults.device_names,
            vec!["UltraMic".to_string(), "Dodotronic".to_string()]
        );
        assert_eq!(config.manager.audio_defaults.window, WindowKind::Blackman);

        std::env::set_var("FFT_SIZE", "1000");
        assert!(ServerConfig::from_env().is_err());

        for key in ["TARGET_FPS", "DEVICE_NAMES", "WINDOW_TYPE", "SMART_SKIP", "FFT_SIZE"] {
            std::env::remove_var(key);
        }
    }
}
