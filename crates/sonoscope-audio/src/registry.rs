use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scans a descriptor has to miss before `cleanup` may drop it.
const CLEANUP_MISSED_SCANS: u32 = 5;
const REGISTRY_FILE: &str = "device_mapping.json";
const REGISTRY_VERSION: u32 = 1;

/// A device as reported by one OS enumeration. The `system_index` is
/// whatever the host assigned this time around and may change.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedDevice {
    pub system_index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: f64,
}

/// Persisted identity of a device, keyed by its stable ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub stable_id: String,
    pub system_index: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: f64,
    pub is_input: bool,
    /// Milliseconds since the Unix epoch of the last enumeration that
    /// actually saw this device.
    pub last_seen: u64,
    #[serde(default)]
    pub missed_scans: u32,
}

impl DeviceDescriptor {
    fn matches(&self, observed: &ObservedDevice) -> bool {
        self.name == observed.name
            && self.max_input_channels == observed.max_input_channels
            && self.default_sample_rate == observed.default_sample_rate
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    v: u32,
    devices: BTreeMap<String, DeviceDescriptor>,
}

/// Maps OS device descriptors to stable IDs that survive reindexing and
/// process restarts, persisted to `device_mapping.json`.
pub struct DeviceRegistry {
    path: PathBuf,
    devices: Mutex<BTreeMap<String, DeviceDescriptor>>,
}

impl DeviceRegistry {
    /// Load the registry from `dir`, quarantining a corrupt file as
    /// `.bak` and starting fresh. The persisted file, when valid, is
    /// authoritative over anything built up in memory.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(REGISTRY_FILE);
        let devices = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RegistryFile>(&contents) {
                Ok(file) if file.v == REGISTRY_VERSION => {
                    tracing::info!(count = file.devices.len(), "Loaded device registry");
                    file.devices
                }
                Ok(file) => {
                    tracing::warn!(version = file.v, "Unknown registry version, starting fresh");
                    quarantine(&path);
                    BTreeMap::new()
                }
                Err(e) => {
                    tracing::warn!("Corrupt device registry ({}), starting fresh", e);
                    quarantine(&path);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Cannot read device registry: {}", e);
                BTreeMap::new()
            }
        };

        Self {
            path,
            devices: Mutex::new(devices),
        }
    }

    /// Merge one OS enumeration into the registry. Devices seen for the
    /// first time get a stable ID assigned; known devices have their
    /// `system_index` and `last_seen` refreshed; absent descriptors age
    /// by one missed scan. Returns the current descriptor set.
    pub fn enumerate(&self, observed: &[ObservedDevice]) -> Vec<DeviceDescriptor> {
        let now = epoch_millis();
        let mut devices = self.devices.lock();

        let mut seen_ids: HashSet<String> = HashSet::new();
        for obs in observed {
            let id = match devices.values().find(|d| d.matches(obs)) {
                Some(existing) => existing.stable_id.clone(),
                None => {
                    let id = assign_stable_id(&devices, obs);
                    tracing::info!(stable_id = %id, name = %obs.name, "New device registered");
                    devices.insert(
                        id.clone(),
                        DeviceDescriptor {
                            stable_id: id.clone(),
                            system_index: obs.system_index,
                            name: obs.name.clone(),
                            max_input_channels: obs.max_input_channels,
                            default_sample_rate: obs.default_sample_rate,
                            is_input: true,
                            last_seen: now,
                            missed_scans: 0,
                        },
                    );
                    id
                }
            };
            if let Some(entry) = devices.get_mut(&id) {
                entry.system_index = obs.system_index;
                entry.last_seen = now;
                entry.missed_scans = 0;
            }
            seen_ids.insert(id);
        }

        for entry in devices.values_mut() {
            if !seen_ids.contains(&entry.stable_id) {
                entry.missed_scans = entry.missed_scans.saturating_add(1);
            }
        }

        devices.values().cloned().collect()
    }

    pub fn resolve(&self, stable_id: &str) -> Option<DeviceDescriptor> {
        self.devices.lock().get(stable_id).cloned()
    }

    pub fn all(&self) -> Vec<DeviceDescriptor> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Drop descriptors unseen for the last five enumerations, unless a
    /// running pipeline still owns them. Returns the removed IDs.
    pub fn cleanup(&self, owned: &HashSet<String>) -> Vec<String> {
        let removed: Vec<String> = {
            let mut devices = self.devices.lock();
            let stale: Vec<String> = devices
                .values()
                .filter(|d| d.missed_scans >= CLEANUP_MISSED_SCANS && !owned.contains(&d.stable_id))
                .map(|d| d.stable_id.clone())
                .collect();
            for id in &stale {
                devices.remove(id);
            }
            stale
        };
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Cleaned up stale device mappings");
        }
        removed
    }

    /// Atomically write the registry: temp file in the same directory,
    /// then rename over the target. The lock is held across the rename.
    pub fn persist(&self) -> io::Result<()> {
        let devices = self.devices.lock();
        let file = RegistryFile {
            v: REGISTRY_VERSION,
            devices: devices.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "Device registry persisted");
        Ok(())
    }
}

fn quarantine(path: &Path) {
    let backup = path.with_extension("json.bak");
    if let Err(e) = fs::rename(path, &backup) {
        tracing::warn!("Could not move corrupt registry aside: {}", e);
    } else {
        tracing::warn!(backup = %backup.display(), "Corrupt registry moved aside");
    }
}

/// Deterministic stable ID: `<slug>_<hash6>` where the slug is a
/// lowercased alphanumeric prefix of the device name and the hash is a
/// SHA-256 digest over name, channel count and default sample rate. Two
/// processes enumerating the same hardware derive the same ID.
pub fn stable_id(name: &str, max_input_channels: u16, default_sample_rate: f64) -> String {
    format!(
        "{}_{}",
        slug(name),
        &identity_digest(name, max_input_channels, default_sample_rate)[..6]
    )
}

fn slug(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    cleaned.chars().take(16).collect()
}

fn identity_digest(name: &str, max_input_channels: u16, default_sample_rate: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(max_input_channels.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(default_sample_rate.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolve hash-suffix collisions between distinct devices by extending
/// the suffix one digest character at a time until it is unique.
fn assign_stable_id(
    devices: &BTreeMap<String, DeviceDescriptor>,
    observed: &ObservedDevice,
) -> String {
    let digest = identity_digest(
        &observed.name,
        observed.max_input_channels,
        observed.default_sample_rate,
    );
    let prefix = slug(&observed.name);
    for len in 6..=digest.len() {
        let candidate = format!("{}_{}", prefix, &digest[..len]);
        match devices.get(&candidate) {
            Some(existing) if !existing.matches(observed) => continue,
            _ => return candidate,
        }
    }
    // The full digest colliding for distinct identities is not reachable
    // with SHA-256 inputs this small.
    format!("{}_{}", prefix, digest)
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
