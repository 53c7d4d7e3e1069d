// src/session.rs
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::data::DataManager;
use crate::error::{AcquisitionError, Result};
use crate::manager::SensorManager;
use crate::types::SensorType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// Running, with a tare window open since the stored tick index.
    Taring(usize),
}

/// One recording session over every configured group.
pub struct AcquisitionSession {
    manager: SensorManager,
    data: DataManager,
    state: SessionState,
    timestamps: Vec<u64>,
    connected: bool,
    checked: bool,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl AcquisitionSession {
    pub fn new(manager: SensorManager) -> Self {
        let data = DataManager::new(manager.settings().platform);
        Self {
            manager,
            data,
            state: SessionState::Idle,
            timestamps: Vec::new(),
            connected: false,
            checked: false,
        }
    }

    /// Probes every group; the result is kept for `get_sensor_connected`.
    pub fn check_connections(&mut self) -> bool {
        let mut any = false;
        for group in self.manager.groups_mut() {
            any |= group.check_connections();
        }
        self.connected = any;
        self.checked = true;
        info!("connection check: sensors available = {any}");
        any
    }

    /// Starts every group. Groups without a reachable sensor sit the session out;
    /// when no group has one the session stays idle.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(AcquisitionError::AlreadyRunning);
        }
        if !self.checked {
            self.check_connections();
        }
        self.timestamps.clear();
        let mut any = false;
        for group in self.manager.groups_mut() {
            group.clear_values();
            any |= group.start();
        }
        if !any {
            for group in self.manager.groups_mut() {
                group.stop();
            }
            warn!("start refused: no sensor available");
            return Err(AcquisitionError::NoSensorAvailable);
        }
        self.state = SessionState::Running;
        info!("session started");
        Ok(())
    }

    pub fn register_tick(&mut self) -> Result<()> {
        self.register_tick_at(now_ms())
    }

    /// Records one timestamp and one value per available sensor.
    pub fn register_tick_at(&mut self, timestamp_ms: u64) -> Result<()> {
        if self.state == SessionState::Idle {
            return Err(AcquisitionError::NotRunning);
        }
        self.timestamps.push(timestamp_ms);
        for group in self.manager.groups_mut() {
            group.register();
        }
        Ok(())
    }

    /// Tares platform sensors with the mean calibrated value recorded between
    /// `start_ms` and `end_ms` (inclusive).
    pub fn tare(&mut self, start_ms: u64, end_ms: u64) -> Result<BTreeMap<String, f64>> {
        if self.state == SessionState::Idle {
            return Err(AcquisitionError::NotRunning);
        }
        let first = self.timestamps.partition_point(|t| *t < start_ms);
        let last = self.timestamps.partition_point(|t| *t <= end_ms);
        Ok(self.tare_range(first, last))
    }

    /// Opens a tare window at the next tick.
    pub fn begin_tare(&mut self) -> Result<()> {
        match self.state {
            SessionState::Running => {
                self.state = SessionState::Taring(self.timestamps.len());
                Ok(())
            }
            SessionState::Taring(_) => Ok(()),
            SessionState::Idle => Err(AcquisitionError::NotRunning),
        }
    }

    /// Closes the tare window and applies it.
    pub fn end_tare(&mut self) -> Result<BTreeMap<String, f64>> {
        let SessionState::Taring(first) = self.state else {
            return Err(AcquisitionError::NotRunning);
        };
        self.state = SessionState::Running;
        Ok(self.tare_range(first, self.timestamps.len()))
    }

    fn tare_range(&mut self, first: usize, last: usize) -> BTreeMap<String, f64> {
        let mut means = BTreeMap::new();
        if first >= last {
            warn!("tare window holds no ticks");
            return means;
        }
        for group in self.manager.groups() {
            for kind in [SensorType::LoadCell, SensorType::Encoder] {
                for sensor in group.sensors(true, Some(kind)) {
                    let values: Vec<f64> = sensor
                        .calibrated_values()
                        .get(first..last)
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|r| r.as_scalar())
                        .filter(|v| v.is_finite())
                        .collect();
                    if !values.is_empty() {
                        let mean = values.iter().sum::<f64>() / values.len() as f64;
                        means.insert(sensor.id().to_string(), mean);
                    }
                }
            }
        }
        self.manager.tare_sensors(&means);
        info!("tared {} sensors over ticks {first}..{last}", means.len());
        means
    }

    /// Disconnects every group and builds the result frames.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Err(AcquisitionError::NotRunning);
        }
        for group in self.manager.groups_mut() {
            group.stop();
        }
        self.state = SessionState::Idle;
        info!("session stopped after {} ticks", self.timestamps.len());

        self.data = DataManager::new(self.manager.settings().platform);
        self.data.load_data(&self.timestamps, self.manager.groups())?;
        let settings = self.manager.settings();
        if settings.filter.enabled {
            let fs = self.data.sample_rate_hz().unwrap_or_else(|| settings.sample_rate_hz());
            if let Err(e) = self
                .data
                .apply_butter_filter(fs, settings.filter.cutoff_hz, settings.filter.order)
            {
                warn!("filtering skipped: {e}");
            }
        }
        Ok(())
    }

    /// Result of the most recent connection check.
    pub fn get_sensor_connected(&self) -> bool {
        self.connected
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    pub fn data(&self) -> &DataManager {
        &self.data
    }

    pub fn manager(&self) -> &SensorManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut SensorManager {
        &mut self.manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::drivers::SimulatedDriverFactory;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn session(config: Value) -> AcquisitionSession {
        AcquisitionSession::new(SensorManager::new(
            ConfigStore::from_value(config),
            Arc::new(SimulatedDriverFactory::default()),
        ))
    }

    fn single_loadcell(offline: bool) -> Value {
        json!({
            "settings": {"filter": {"enabled": false}},
            "sensor_groups": {"g": {"name": "G", "type": "GROUP_DEFAULT", "read": true, "sensor_list": ["lc"]}},
            "sensors": {"lc": {"name": "lc", "type": "SENSOR_LOADCELL", "read": true,
                               "connection": {"serial": "1", "channel": 0},
                               "properties": {"simulated_value": 5.0, "offline": offline},
                               "calibration": {"slope": 2.0, "intercept": -1.0}}}
        })
    }

    #[test]
    fn start_refuses_without_sensors() {
        let mut session = session(single_loadcell(true));
        assert!(matches!(session.start(), Err(AcquisitionError::NoSensorAvailable)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.get_sensor_connected());
    }

    #[test]
    fn ticks_require_a_running_session() {
        let mut session = session(single_loadcell(false));
        assert!(matches!(session.register_tick(), Err(AcquisitionError::NotRunning)));
        assert!(session.tare(0, 1).is_err());
        assert!(session.stop().is_err());
    }

    #[test]
    fn session_records_and_calibrates() {
        let mut session = session(single_loadcell(false));
        session.start().unwrap();
        assert!(session.get_sensor_connected());
        assert!(matches!(session.start(), Err(AcquisitionError::AlreadyRunning)));
        for i in 0..5 {
            session.register_tick_at(100 + i * 10).unwrap();
        }
        session.stop().unwrap();
        let calibrated = session.data().calibrated_frame(None).unwrap();
        assert_eq!(calibrated.column_vec("lc"), Some(vec![9.0; 5]));
        assert!(session.data().results().filtered.is_empty());
    }

    #[test]
    fn tare_window_is_closed_by_end_tare() {
        let mut session = session(single_loadcell(false));
        session.start().unwrap();
        assert!(session.end_tare().is_err());
        session.register_tick_at(0).unwrap();
        session.begin_tare().unwrap();
        session.register_tick_at(10).unwrap();
        session.register_tick_at(20).unwrap();
        let means = session.end_tare().unwrap();
        assert_eq!(means.get("lc"), Some(&9.0));
        assert_eq!(session.state(), SessionState::Running);
        session.stop().unwrap();
    }
}
