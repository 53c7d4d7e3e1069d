// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::processing::PlatformGeometry;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub enabled: bool,
    pub cutoff_hz: f64,
    pub order: usize,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cutoff_hz: 10.0,
            order: 2,
        }
    }
}

/// Sensors used by the calibration dialogs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationReference {
    /// Sensor id of the plain reference loadcell.
    pub loadcell: Option<String>,
    /// Group id of the reference platform.
    pub platform: Option<String>,
}

/// General settings, read from the `settings` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tick_interval_ms: u64,
    pub tare_duration_ms: u64,
    pub calibration_samples: usize,
    pub connect_timeout_ms: u64,
    pub worker_count: usize,
    pub output_folder: String,
    pub test_name: String,
    pub filter: FilterSettings,
    pub platform: PlatformGeometry,
    pub calibration_reference: CalibrationReference,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            tare_duration_ms: 2000,
            calibration_samples: 200,
            connect_timeout_ms: 2000,
            worker_count: 4,
            output_folder: "results".to_string(),
            test_name: "Test".to_string(),
            filter: FilterSettings::default(),
            platform: PlatformGeometry::default(),
            calibration_reference: CalibrationReference::default(),
        }
    }
}

impl Settings {
    pub fn sample_rate_hz(&self) -> f64 {
        1000.0 / self.tick_interval_ms.max(1) as f64
    }
}

/// Nested key/value configuration with dotted key paths (`sensors.lc_1.read`).
///
/// When loaded from a file every `set` is written straight back to it.
#[derive(Clone, Debug, Default)]
pub struct ConfigStore {
    root: Value,
    path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn from_value(root: Value) -> Self {
        Self { root, path: None }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let root = serde_json::from_str(&text)?;
        Ok(Self {
            root,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_string_pretty(&self.root)?)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, key_path: &str) -> Option<&Value> {
        key_path
            .split('.')
            .try_fold(&self.root, |node, key| node.get(key))
    }

    /// Sets a value, creating intermediate objects as needed.
    pub fn set(&mut self, key_path: &str, value: impl Into<Value>) {
        let mut node = &mut self.root;
        for key in key_path.split('.') {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            node = map.entry(key.to_string()).or_insert(Value::Null);
        }
        *node = value.into();
        if let Err(e) = self.save() {
            warn!("could not persist {key_path}: {e}");
        }
    }

    pub fn section(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    pub fn settings(&self) -> Settings {
        match self.get("settings") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!("invalid settings section, using defaults: {e}");
                Settings::default()
            }),
            None => Settings::default(),
        }
    }
}
