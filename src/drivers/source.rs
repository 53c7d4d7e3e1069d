use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::drivers::DriverError;
use crate::types::{Reading, SensorType};

/// Connection section of a sensor definition.
#[derive(Clone, Debug, Default)]
pub struct ConnectionParams {
    pub serial: String,
    pub channel: Option<u32>,
    /// Encoder zero position, added to every encoder reading.
    pub initial_position: Option<f64>,
    pub properties: BTreeMap<String, Value>,
}

impl ConnectionParams {
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }

    pub fn property_bool(&self, key: &str) -> Option<bool> {
        self.properties.get(key).and_then(Value::as_bool)
    }
}

/// Capability every hardware family provides.
///
/// Drivers keep their own background update mechanism; `read` only returns the
/// latest cached value and never blocks on I/O.
pub trait SensorDriver: Send + Sync {
    fn connect(&self, timeout: Duration) -> Result<(), DriverError>;
    fn disconnect(&self);
    fn read(&self) -> Option<Reading>;
    fn is_connected(&self) -> bool;
}

/// Builds the driver matching a sensor's declared type.
pub trait DriverFactory: Send + Sync {
    fn create(&self, kind: SensorType, params: &ConnectionParams) -> Option<Arc<dyn SensorDriver>>;
}

/// Latest value written by a driver's updater and read by the tick path.
#[derive(Debug, Default)]
pub struct ReadingCell {
    latest: Mutex<Option<Reading>>,
}

impl ReadingCell {
    pub fn store(&self, reading: Reading) {
        *self.latest.lock() = Some(reading);
    }

    pub fn load(&self) -> Option<Reading> {
        *self.latest.lock()
    }

    pub fn clear(&self) {
        *self.latest.lock() = None;
    }
}
