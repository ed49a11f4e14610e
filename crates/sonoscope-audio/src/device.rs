use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host, SampleFormat, SupportedStreamConfigRange};

use sonoscope_foundation::AudioError;

use crate::registry::ObservedDevice;

/// Thin wrapper over the cpal host for input-device discovery and
/// preference-ordered selection.
pub struct DeviceSelector {
    host: Host,
}

impl Default for DeviceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSelector {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    /// Snapshot of the host's input devices for the registry. Devices
    /// that refuse to report a default config are skipped.
    pub fn scan(&self) -> Vec<ObservedDevice> {
        let mut observed = Vec::new();
        let Ok(inputs) = self.host.input_devices() else {
            tracing::warn!("Input device enumeration failed");
            return observed;
        };
        for (index, device) in inputs.enumerate() {
            let Ok(name) = device.name() else { continue };
            let Ok(config) = device.default_input_config() else {
                continue;
            };
            observed.push(ObservedDevice {
                system_index: index,
                name,
                max_input_channels: config.channels(),
                default_sample_rate: config.sample_rate().0 as f64,
            });
        }
        observed
    }

    pub fn default_input_name(&self) -> Option<String> {
        self.host.default_input_device().and_then(|d| d.name().ok())
    }

    /// Open the first device whose name matches one of the preferred
    /// substrings, in preference order; fall back to the host default.
    pub fn open(&self, preferred: &[String]) -> Result<Device, AudioError> {
        for wanted in preferred {
            if let Some(device) = self.find_matching(wanted) {
                if let Ok(name) = device.name() {
                    tracing::info!(device = %name, wanted = %wanted, "Selected input device");
                }
                return Ok(device);
            }
        }

        if !preferred.is_empty() {
            tracing::warn!(
                "No device matched preferences {:?}; falling back to host default",
                preferred
            );
        }
        self.host
            .default_input_device()
            .ok_or(AudioError::DeviceNotFound { name: None })
    }

    /// Exact name match first, then case-insensitive substring.
    fn find_matching(&self, wanted: &str) -> Option<Device> {
        let devices: Vec<Device> = self.host.input_devices().ok()?.collect();
        for device in &devices {
            if device.name().map(|n| n == wanted).unwrap_or(false) {
                return Some(device.clone());
            }
        }
        let wanted_lower = wanted.to_lowercase();
        devices.into_iter().find(|device| {
            device
                .name()
                .map(|n| n.to_lowercase().contains(&wanted_lower))
                .unwrap_or(false)
        })
    }
}

/// Pick a supported config range that can run at `sample_rate`,
/// preferring f32 formats.
pub fn negotiate_rate(
    device: &Device,
    sample_rate: u32,
) -> Result<(u16, SampleFormat), AudioError> {
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(AudioError::SupportedStreamConfigs)?
        .collect();

    let supports = |r: &SupportedStreamConfigRange| {
        r.min_sample_rate().0 <= sample_rate && r.max_sample_rate().0 >= sample_rate
    };

    ranges
        .iter()
        .filter(|r| supports(r))
        .max_by_key(|r| matches!(r.sample_format(), SampleFormat::F32) as u8)
        .map(|r| (r.channels(), r.sample_format()))
        .ok_or(AudioError::UnsupportedRate {
            name,
            rate: sample_rate,
        })
}
