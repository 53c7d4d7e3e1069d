// src/sensor.rs
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::drivers::{ConnectionParams, DriverError, DriverFactory, SensorDriver};
use crate::types::{Reading, SensorStatus, SensorType};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Extra time granted to a driver to report its own timeout before we give up on it.
const CONNECT_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionSection {
    pub serial: Option<String>,
    pub channel: Option<u32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSection {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for CalibrationSection {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

/// One entry of the `sensors` configuration section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorParams {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SensorType,
    pub read: bool,
    pub connection: ConnectionSection,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub calibration: CalibrationSection,
    #[serde(default)]
    pub initial_position: Option<f64>,
}

impl SensorParams {
    /// Type-specific connection keys: every sensor needs `serial`, loadcells and
    /// encoders also need `channel`.
    pub fn missing_connection_key(&self) -> Option<&'static str> {
        if self.connection.serial.is_none() {
            return Some("serial");
        }
        if self.kind.needs_channel() && self.connection.channel.is_none() {
            return Some("channel");
        }
        None
    }

    pub fn connection_params(&self) -> Option<ConnectionParams> {
        if self.missing_connection_key().is_some() {
            return None;
        }
        Some(ConnectionParams {
            serial: self.connection.serial.clone().unwrap_or_default(),
            channel: self.connection.channel,
            initial_position: self.initial_position,
            properties: self.properties.clone(),
        })
    }
}

/// One physical channel: driver, calibration and the values recorded this session.
pub struct Sensor {
    id: String,
    name: String,
    kind: SensorType,
    read: bool,
    status: SensorStatus,
    slope: f64,
    intercept: f64,
    properties: BTreeMap<String, Value>,
    driver: Option<Arc<dyn SensorDriver>>,
    values: Vec<Reading>,
    connect_timeout: Duration,
}

impl Sensor {
    pub fn new(id: &str, name: &str, kind: SensorType) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            read: true,
            status: SensorStatus::NotFound,
            slope: 1.0,
            intercept: 0.0,
            properties: BTreeMap::new(),
            driver: None,
            values: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builds a sensor from its configuration entry. No driver is bound when the
    /// connection section is incomplete.
    pub fn setup(id: &str, params: &SensorParams, factory: &dyn DriverFactory) -> Self {
        let mut sensor = Self::new(id, &params.name, params.kind)
            .with_calibration(params.calibration.slope, params.calibration.intercept);
        sensor.set_read(params.read);
        sensor.properties = params.properties.clone();
        sensor.driver = params
            .connection_params()
            .and_then(|connection| factory.create(params.kind, &connection));
        sensor
    }

    pub fn with_driver(mut self, driver: Arc<dyn SensorDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_calibration(mut self, slope: f64, intercept: f64) -> Self {
        self.slope = slope;
        self.intercept = intercept;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Opens the device.
    ///
    /// With `check == false` only a sensor already seen as available is
    /// (re)connected, so a session never retries devices the last probe missed.
    pub fn connect(&mut self, check: bool) -> bool {
        if !self.read {
            self.status = SensorStatus::Ignored;
            return false;
        }
        if !check && self.status != SensorStatus::Available {
            return false;
        }
        self.status = SensorStatus::NotFound;
        let Some(driver) = &self.driver else {
            debug!("{} ({}): no driver bound", self.id, self.name);
            return false;
        };
        match connect_with_timeout(&self.id, driver, self.connect_timeout) {
            Ok(()) => {
                self.status = SensorStatus::Available;
                debug!("{} ({}): connected", self.id, self.name);
                true
            }
            Err(e) => {
                debug!("{} ({}): {e}", self.id, self.name);
                false
            }
        }
    }

    /// Probe: connects, then releases the device again.
    pub fn check_connection(&mut self) -> bool {
        let connected = self.connect(true);
        if connected {
            self.disconnect();
        }
        connected
    }

    pub fn disconnect(&self) {
        if let Some(driver) = &self.driver {
            driver.disconnect();
        }
    }

    /// Appends the driver's latest cached value, or a NaN placeholder when the
    /// driver has nothing, so every tick adds exactly one value.
    pub fn register_value(&mut self) {
        if self.status != SensorStatus::Available {
            return;
        }
        let reading = self
            .driver
            .as_ref()
            .and_then(|driver| driver.read())
            .unwrap_or_else(|| Reading::placeholder(self.kind));
        self.values.push(reading);
    }

    /// Latest cached value, without recording it.
    pub fn read_current(&self) -> Option<Reading> {
        if self.status != SensorStatus::Available {
            return None;
        }
        self.driver.as_ref().and_then(|driver| driver.read())
    }

    pub fn set_read(&mut self, read: bool) {
        self.read = read;
        if !read {
            self.status = SensorStatus::Ignored;
        } else if self.status == SensorStatus::Ignored {
            self.status = SensorStatus::NotFound;
        }
    }

    pub fn set_slope(&mut self, slope: f64) {
        self.slope = slope;
    }

    pub fn set_intercept(&mut self, intercept: f64) {
        self.intercept = intercept;
    }

    pub fn clear_values(&mut self) {
        self.values.clear();
    }

    pub(crate) fn mark_ignored(&mut self) {
        self.status = SensorStatus::Ignored;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorType {
        self.kind
    }

    pub fn read(&self) -> bool {
        self.read
    }

    pub fn status(&self) -> SensorStatus {
        self.status
    }

    pub fn is_available(&self) -> bool {
        self.status == SensorStatus::Available
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn calibration(&self) -> (f64, f64) {
        (self.slope, self.intercept)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn values(&self) -> &[Reading] {
        &self.values
    }

    pub fn calibrate(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }

    /// Scalar values through `slope * v + intercept`; IMU readings pass unchanged.
    pub fn calibrated_values(&self) -> Vec<Reading> {
        self.values
            .iter()
            .map(|reading| match reading {
                Reading::Scalar(v) => Reading::Scalar(self.calibrate(*v)),
                other => *other,
            })
            .collect()
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("read", &self.read)
            .field("status", &self.status)
            .field("slope", &self.slope)
            .field("intercept", &self.intercept)
            .field("values", &self.values.len())
            .finish()
    }
}

/// Runs the driver's connect on a helper thread so a driver that ignores its
/// timeout cannot block the caller.
fn connect_with_timeout(
    label: &str,
    driver: &Arc<dyn SensorDriver>,
    timeout: Duration,
) -> Result<(), DriverError> {
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(driver);
    thread::spawn(move || {
        let result = worker.connect(timeout);
        let connected = result.is_ok();
        // Caller already gave up: release the late connection.
        if tx.send(result).is_err() && connected {
            worker.disconnect();
        }
    });
    match rx.recv_timeout(timeout + CONNECT_GRACE) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout {
            serial: label.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => {
            Err(DriverError::NotConnected("connect worker exited".into()))
        }
    }
}
