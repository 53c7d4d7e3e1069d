// src/manager.rs
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{ConfigStore, Settings};
use crate::drivers::DriverFactory;
use crate::group::SensorGroup;
use crate::sensor::{Sensor, SensorParams};
use crate::types::GroupType;

/// One entry of the `sensor_groups` configuration section.
#[derive(Clone, Debug, Deserialize)]
struct GroupParams {
    name: String,
    #[serde(rename = "type")]
    kind: GroupType,
    read: bool,
    sensor_list: Vec<String>,
}

/// Sensor topology built from configuration.
pub struct SensorManager {
    config: ConfigStore,
    factory: Arc<dyn DriverFactory>,
    settings: Settings,
    groups: Vec<SensorGroup>,
}

impl SensorManager {
    pub fn new(config: ConfigStore, factory: Arc<dyn DriverFactory>) -> Self {
        let mut manager = Self {
            settings: config.settings(),
            config,
            factory,
            groups: Vec::new(),
        };
        manager.setup();
        manager
    }

    /// (Re)builds every group. Broken entries are logged and skipped.
    pub fn setup(&mut self) {
        self.settings = self.config.settings();
        self.groups.clear();
        let Some(definitions) = self.config.section("sensor_groups").cloned() else {
            warn!("configuration has no sensor_groups section");
            return;
        };
        for (group_id, value) in definitions {
            let params: GroupParams = match serde_json::from_value(value) {
                Ok(params) => params,
                Err(e) => {
                    warn!("skipping group {group_id}: {e}");
                    continue;
                }
            };
            if params.sensor_list.is_empty() {
                warn!("skipping group {group_id}: empty sensor_list");
                continue;
            }
            let mut group = SensorGroup::new(&group_id, &params.name, params.kind, params.read)
                .with_worker_count(self.settings.worker_count);
            for sensor_id in &params.sensor_list {
                if let Some(sensor) = self.load_sensor(sensor_id) {
                    group.add_sensor(sensor);
                }
            }
            info!("group {group_id}: {} of {} sensors loaded", group.len(), params.sensor_list.len());
            self.groups.push(group);
        }
    }

    /// Builds a fresh sensor from its canonical definition.
    pub fn load_sensor(&self, sensor_id: &str) -> Option<Sensor> {
        let Some(value) = self.config.section("sensors").and_then(|s| s.get(sensor_id)) else {
            warn!("sensor {sensor_id} is not defined");
            return None;
        };
        let params: SensorParams = match serde_json::from_value(value.clone()) {
            Ok(params) => params,
            Err(e) => {
                warn!("skipping sensor {sensor_id}: {e}");
                return None;
            }
        };
        if let Some(key) = params.missing_connection_key() {
            warn!("skipping sensor {sensor_id}: connection.{key} is required for {:?}", params.kind);
            return None;
        }
        let timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        Some(Sensor::setup(sensor_id, &params, self.factory.as_ref()).with_connect_timeout(timeout))
    }

    /// `sensor_id == None` toggles the whole group. Persisted to the configuration.
    pub fn set_sensor_read(&mut self, read: bool, group_id: &str, sensor_id: Option<&str>) -> bool {
        let Some(group) = self.groups.iter_mut().find(|g| g.id() == group_id) else {
            warn!("unknown group {group_id}");
            return false;
        };
        match sensor_id {
            None => {
                group.set_read(read);
                self.config.set(&format!("sensor_groups.{group_id}.read"), read);
            }
            Some(sensor_id) => {
                let Some(sensor) = group.sensor_mut(sensor_id) else {
                    warn!("group {group_id} has no sensor {sensor_id}");
                    return false;
                };
                sensor.set_read(read);
                self.config.set(&format!("sensors.{sensor_id}.read"), read);
            }
        }
        true
    }

    /// `intercept -= mean` for every listed sensor found in a platform group.
    pub fn tare_sensors(&mut self, means: &BTreeMap<String, f64>) {
        let mut updated = BTreeMap::new();
        for group in self.groups.iter_mut().filter(|g| g.kind() == GroupType::Platform) {
            for (sensor_id, mean) in means {
                if let Some(sensor) = group.sensor_mut(sensor_id) {
                    let intercept = sensor.intercept() - mean;
                    sensor.set_intercept(intercept);
                    updated.insert(sensor_id.clone(), intercept);
                }
            }
        }
        for (sensor_id, intercept) in updated {
            self.config
                .set(&format!("sensors.{sensor_id}.calibration.intercept"), intercept);
        }
    }

    /// Writes a calibration result to every group holding the sensor.
    pub fn set_sensor_calibration(&mut self, sensor_id: &str, slope: f64, intercept: f64) -> bool {
        let mut found = false;
        for group in &mut self.groups {
            if let Some(sensor) = group.sensor_mut(sensor_id) {
                sensor.set_slope(slope);
                sensor.set_intercept(intercept);
                found = true;
            }
        }
        if found {
            self.config.set(
                &format!("sensors.{sensor_id}.calibration"),
                serde_json::json!({"slope": slope, "intercept": intercept}),
            );
        }
        found
    }

    pub fn groups(&self) -> &[SensorGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [SensorGroup] {
        &mut self.groups
    }

    pub fn default_groups(&self) -> Vec<&SensorGroup> {
        self.groups_of(GroupType::Default)
    }

    pub fn platform_groups(&self) -> Vec<&SensorGroup> {
        self.groups_of(GroupType::Platform)
    }

    fn groups_of(&self, kind: GroupType) -> Vec<&SensorGroup> {
        self.groups.iter().filter(|g| g.kind() == kind).collect()
    }

    pub fn group(&self, group_id: &str) -> Option<&SensorGroup> {
        self.groups.iter().find(|g| g.id() == group_id)
    }

    pub fn group_mut(&mut self, group_id: &str) -> Option<&mut SensorGroup> {
        self.groups.iter_mut().find(|g| g.id() == group_id)
    }

    pub fn find_sensor(&self, sensor_id: &str) -> Option<&Sensor> {
        self.groups.iter().find_map(|g| g.sensor(sensor_id))
    }

    pub fn calibration_loadcell(&self) -> Option<&Sensor> {
        let id = self.settings.calibration_reference.loadcell.as_deref()?;
        self.find_sensor(id)
    }

    pub fn calibration_platform(&self) -> Option<&SensorGroup> {
        let id = self.settings.calibration_reference.platform.as_deref()?;
        self.group(id)
            .filter(|g| g.kind() == GroupType::Platform)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn config_value(&self, key_path: &str) -> Option<&Value> {
        self.config.get(key_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SimulatedDriverFactory;
    use serde_json::json;

    fn manager(config: Value) -> SensorManager {
        SensorManager::new(
            ConfigStore::from_value(config),
            Arc::new(SimulatedDriverFactory::default()),
        )
    }

    fn loadcell(name: &str, channel: u32) -> Value {
        json!({
            "name": name,
            "type": "SENSOR_LOADCELL",
            "read": true,
            "connection": {"serial": "100", "channel": channel},
            "properties": {"simulated_value": 1.0}
        })
    }

    #[test]
    fn bad_entries_are_skipped() {
        let manager = manager(json!({
            "sensor_groups": {
                "g1": {"name": "G1", "type": "GROUP_DEFAULT", "read": true,
                       "sensor_list": ["lc", "no_channel", "bad_type", "missing"]},
                "g2": {"name": "G2", "type": "GROUP_UNKNOWN", "read": true, "sensor_list": ["lc"]},
                "g3": {"name": "G3", "read": true, "sensor_list": ["lc"]},
                "g4": {"name": "G4", "type": "GROUP_DEFAULT", "read": true, "sensor_list": []}
            },
            "sensors": {
                "lc": loadcell("lc", 0),
                "no_channel": {"name": "x", "type": "SENSOR_ENCODER", "read": true,
                               "connection": {"serial": "1"}},
                "bad_type": {"name": "x", "type": "SENSOR_GPS", "read": true,
                             "connection": {"serial": "1", "channel": 0}},
                "imu": {"name": "imu", "type": "SENSOR_IMU", "read": true,
                        "connection": {"serial": "2"}}
            }
        }));
        assert_eq!(manager.groups().len(), 1);
        let group = manager.group("g1").unwrap();
        assert_eq!(group.len(), 1);
        assert!(group.sensor("lc").is_some());
        assert!(manager.load_sensor("imu").is_some());
    }

    #[test]
    fn groups_keep_configuration_order() {
        let config: Value = serde_json::from_str(
            r#"{
                "sensor_groups": {
                    "zeta": {"name": "Z", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["b", "a"]},
                    "alpha": {"name": "A", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["a"]}
                },
                "sensors": {
                    "a": {"name": "a", "type": "SENSOR_LOADCELL", "read": true,
                          "connection": {"serial": "100", "channel": 0}},
                    "b": {"name": "b", "type": "SENSOR_LOADCELL", "read": true,
                          "connection": {"serial": "100", "channel": 1}}
                }
            }"#,
        )
        .unwrap();
        let manager = manager(config);
        let ids: Vec<&str> = manager.groups().iter().map(|g| g.id()).collect();
        assert_eq!(ids, ["zeta", "alpha"]);
        let names: Vec<&str> = manager.groups()[0].sensors(false, None).iter().map(|s| s.name()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn read_flags_persist_to_config() {
        let mut manager = manager(json!({
            "sensor_groups": {"g": {"name": "G", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["lc"]}},
            "sensors": {"lc": loadcell("lc", 0)}
        }));
        assert!(manager.set_sensor_read(false, "g", Some("lc")));
        assert!(!manager.group("g").unwrap().sensor("lc").unwrap().read());
        assert_eq!(manager.config_value("sensors.lc.read"), Some(&json!(false)));
        assert!(manager.set_sensor_read(false, "g", None));
        assert!(!manager.group("g").unwrap().read());
        assert!(!manager.set_sensor_read(true, "nope", None));
    }

    #[test]
    fn tare_only_touches_platform_groups() {
        let mut manager = manager(json!({
            "sensor_groups": {
                "plate": {"name": "P", "type": "GROUP_PLATFORM", "read": true, "sensor_list": ["a"]},
                "other": {"name": "O", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["b"]}
            },
            "sensors": {"a": loadcell("P_Z_1", 0), "b": loadcell("b", 1)}
        }));
        let means = BTreeMap::from([("a".to_string(), 2.5), ("b".to_string(), 4.0)]);
        manager.tare_sensors(&means);
        assert_eq!(manager.find_sensor("a").unwrap().intercept(), -2.5);
        assert_eq!(manager.find_sensor("b").unwrap().intercept(), 0.0);
        assert_eq!(manager.config_value("sensors.a.calibration.intercept"), Some(&json!(-2.5)));

        manager.tare_sensors(&BTreeMap::from([("a".to_string(), 0.0)]));
        assert_eq!(manager.find_sensor("a").unwrap().intercept(), -2.5);
    }

    #[test]
    fn calibration_references_resolve() {
        let manager = manager(json!({
            "settings": {"calibration_reference": {"loadcell": "b", "platform": "plate"}},
            "sensor_groups": {
                "plate": {"name": "P", "type": "GROUP_PLATFORM", "read": true, "sensor_list": ["a"]},
                "other": {"name": "O", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["b"]}
            },
            "sensors": {"a": loadcell("P_Z_1", 0), "b": loadcell("b", 1)}
        }));
        assert_eq!(manager.calibration_loadcell().unwrap().id(), "b");
        assert_eq!(manager.calibration_platform().unwrap().id(), "plate");
        assert_eq!(manager.platform_groups().len(), 1);
        assert_eq!(manager.default_groups().len(), 1);
    }
}
