// src/group.rs
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, info};
use parking_lot::Mutex;

use crate::sensor::Sensor;
use crate::types::{GroupStatus, GroupType, SensorStatus, SensorType, PLATFORM_LABELS};

pub const DEFAULT_WORKERS: usize = 4;

/// Named set of sensors sharing connection, start and stop.
#[derive(Debug)]
pub struct SensorGroup {
    id: String,
    name: String,
    kind: GroupType,
    read: bool,
    sensors: Vec<Sensor>,
    active: bool,
    worker_count: usize,
}

impl SensorGroup {
    pub fn new(id: &str, name: &str, kind: GroupType, read: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            read,
            sensors: Vec::new(),
            active: false,
            worker_count: DEFAULT_WORKERS,
        }
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    /// Inserts by id. Re-adding an id replaces the sensor in place.
    pub fn add_sensor(&mut self, sensor: Sensor) {
        match self.sensors.iter_mut().find(|s| s.id() == sensor.id()) {
            Some(slot) => *slot = sensor,
            None => self.sensors.push(sensor),
        }
    }

    /// Readiness probe; true when at least one member answered.
    pub fn check_connections(&mut self) -> bool {
        if !self.read {
            self.ignore_all();
            return false;
        }
        let any = self.fan_out(Sensor::check_connection);
        debug!("group {}: probe found sensors = {any}", self.id);
        any
    }

    pub fn start(&mut self) -> bool {
        self.active = if self.read {
            self.fan_out(|sensor| sensor.connect(false))
        } else {
            self.ignore_all();
            false
        };
        info!("group {} ({}) active = {}", self.id, self.name, self.active);
        self.active
    }

    /// One acquisition tick. Drivers only hand back cached values here.
    pub fn register(&mut self) {
        if !self.active {
            return;
        }
        for sensor in &mut self.sensors {
            sensor.register_value();
        }
    }

    pub fn stop(&mut self) {
        self.fan_out(|sensor| {
            sensor.disconnect();
            true
        });
        self.active = false;
    }

    pub fn clear_values(&mut self) {
        for sensor in &mut self.sensors {
            sensor.clear_values();
        }
    }

    fn ignore_all(&mut self) {
        for sensor in &mut self.sensors {
            sensor.mark_ignored();
        }
    }

    /// Runs `op` on every member from a bounded pool of scoped workers pulling
    /// from a shared queue; returns whether any call returned true.
    fn fan_out<F>(&mut self, op: F) -> bool
    where
        F: Fn(&mut Sensor) -> bool + Sync,
    {
        if self.sensors.is_empty() {
            return false;
        }
        let workers = self.worker_count.clamp(1, self.sensors.len());
        let queue = Mutex::new(self.sensors.iter_mut());
        let any = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().next();
                    let Some(sensor) = next else { break };
                    if op(sensor) {
                        any.store(true, Ordering::SeqCst);
                    }
                });
            }
        });
        any.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> GroupStatus {
        let available = self.sensors.iter().filter(|s| s.is_available()).count();
        if available == 0 {
            return GroupStatus::Error;
        }
        let missing = self
            .sensors
            .iter()
            .any(|s| s.read() && s.status() == SensorStatus::NotFound);
        if missing || (self.kind == GroupType::Platform && !self.is_platform_ready()) {
            GroupStatus::Warning
        } else {
            GroupStatus::Ok
        }
    }

    /// All twelve `_X_1`..`_Z_4` loadcells present and available.
    pub fn is_platform_ready(&self) -> bool {
        self.kind == GroupType::Platform
            && PLATFORM_LABELS.iter().all(|label| {
                self.sensors.iter().any(|s| {
                    s.is_available() && s.kind() == SensorType::LoadCell && s.name().contains(label.as_str())
                })
            })
    }

    pub fn sensors(&self, available_only: bool, kind: Option<SensorType>) -> Vec<&Sensor> {
        self.sensors
            .iter()
            .filter(|s| !available_only || s.is_available())
            .filter(|s| kind.map_or(true, |k| s.kind() == k))
            .collect()
    }

    pub fn sensor(&self, id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.id() == id)
    }

    pub fn sensor_mut(&mut self, id: &str) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.id() == id)
    }

    pub fn slopes(&self) -> BTreeMap<String, f64> {
        self.sensors
            .iter()
            .map(|s| (s.id().to_string(), s.slope()))
            .collect()
    }

    pub fn intercepts(&self) -> BTreeMap<String, f64> {
        self.sensors
            .iter()
            .map(|s| (s.id().to_string(), s.intercept()))
            .collect()
    }

    pub fn set_read(&mut self, read: bool) {
        self.read = read;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> GroupType {
        self.kind
    }

    pub fn read(&self) -> bool {
        self.read
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
