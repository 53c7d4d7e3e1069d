use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::drivers::{ConnectionParams, DriverError, DriverFactory, ReadingCell, SensorDriver};
use crate::types::{ImuReading, Reading, SensorType};

const UPDATE_PERIOD: Duration = Duration::from_millis(2);
const GRAVITY: f64 = 9.81;

/// What a simulated device reports.
#[derive(Clone, Copy, Debug)]
pub enum SimulatedSignal {
    Constant(Reading),
    Sine {
        offset: f64,
        amplitude: f64,
        frequency_hz: f64,
        noise: f64,
    },
}

impl SimulatedSignal {
    fn sample(&self, kind: SensorType, t_secs: f64, rng: &mut impl Rng) -> Reading {
        match *self {
            SimulatedSignal::Constant(reading) => reading,
            SimulatedSignal::Sine {
                offset,
                amplitude,
                frequency_hz,
                noise,
            } => {
                let omega = 2.0 * std::f64::consts::PI * frequency_hz;
                let mut jitter = || {
                    if noise > 0.0 {
                        rng.gen_range(-noise..noise)
                    } else {
                        0.0
                    }
                };
                match kind {
                    SensorType::Imu => {
                        // Rocking about the vertical axis.
                        let angle = offset + amplitude * (omega * t_secs).sin();
                        let half = angle / 2.0;
                        Reading::Imu(ImuReading {
                            orientation: [0.0, 0.0, half.sin(), half.cos()],
                            angular_velocity: [
                                jitter(),
                                jitter(),
                                amplitude * omega * (omega * t_secs).cos(),
                            ],
                            linear_acceleration: [jitter(), jitter(), GRAVITY + jitter()],
                        })
                    }
                    _ => Reading::Scalar(offset + amplitude * (omega * t_secs).sin() + jitter()),
                }
            }
        }
    }
}

/// In-process device used for dry runs and tests.
pub struct SimulatedDriver {
    serial: String,
    kind: SensorType,
    signal: SimulatedSignal,
    reachable: bool,
    connect_delay: Duration,
    connect_attempts: AtomicUsize,
    connected: Arc<AtomicBool>,
    cell: Arc<ReadingCell>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDriver {
    pub fn new(serial: &str, kind: SensorType, signal: SimulatedSignal) -> Self {
        Self {
            serial: serial.to_string(),
            kind,
            signal,
            reachable: true,
            connect_delay: Duration::ZERO,
            connect_attempts: AtomicUsize::new(0),
            connected: Arc::new(AtomicBool::new(false)),
            cell: Arc::new(ReadingCell::default()),
            updater: Mutex::new(None),
        }
    }

    pub fn constant(serial: &str, value: f64) -> Self {
        Self::new(
            serial,
            SensorType::LoadCell,
            SimulatedSignal::Constant(Reading::Scalar(value)),
        )
    }

    pub fn unreachable(serial: &str) -> Self {
        let mut driver = Self::constant(serial, 0.0);
        driver.reachable = false;
        driver
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    fn stop_updater(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.updater.lock().take() {
            let _ = handle.join();
        }
    }
}

impl SensorDriver for SimulatedDriver {
    fn connect(&self, timeout: Duration) -> Result<(), DriverError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.connect_delay > timeout {
            thread::sleep(timeout);
            return Err(DriverError::Timeout {
                serial: self.serial.clone(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        thread::sleep(self.connect_delay);
        if !self.reachable {
            return Err(DriverError::NotFound {
                serial: self.serial.clone(),
            });
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let started = Instant::now();
        let mut rng = rand::thread_rng();
        self.cell.store(self.signal.sample(self.kind, 0.0, &mut rng));
        if let SimulatedSignal::Sine { .. } = self.signal {
            let connected = Arc::clone(&self.connected);
            let cell = Arc::clone(&self.cell);
            let signal = self.signal;
            let kind = self.kind;
            *self.updater.lock() = Some(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while connected.load(Ordering::SeqCst) {
                    let t = started.elapsed().as_secs_f64();
                    cell.store(signal.sample(kind, t, &mut rng));
                    thread::sleep(UPDATE_PERIOD);
                }
            }));
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.stop_updater();
        self.cell.clear();
    }

    fn read(&self) -> Option<Reading> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        self.cell.load()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.stop_updater();
    }
}

/// Builds simulated devices from sensor properties.
///
/// `properties.offline = true` makes the device unreachable and
/// `properties.simulated_value` pins a scalar sensor to a constant.
#[derive(Clone, Debug)]
pub struct SimulatedDriverFactory {
    pub amplitude: f64,
    pub frequency_hz: f64,
    pub noise: f64,
}

impl Default for SimulatedDriverFactory {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            frequency_hz: 0.5,
            noise: 0.01,
        }
    }
}

impl DriverFactory for SimulatedDriverFactory {
    fn create(&self, kind: SensorType, params: &ConnectionParams) -> Option<Arc<dyn SensorDriver>> {
        if params.property_bool("offline").unwrap_or(false) {
            return Some(Arc::new(SimulatedDriver::unreachable(&params.serial)));
        }
        let offset = params.initial_position.unwrap_or(0.0);
        let signal = match (kind, params.property_f64("simulated_value")) {
            (SensorType::Imu, Some(_)) => SimulatedSignal::Constant(Reading::Imu(ImuReading {
                orientation: [0.0, 0.0, 0.0, 1.0],
                angular_velocity: [0.0; 3],
                linear_acceleration: [0.0, 0.0, GRAVITY],
            })),
            (_, Some(value)) => SimulatedSignal::Constant(Reading::Scalar(value + offset)),
            (_, None) => SimulatedSignal::Sine {
                offset,
                amplitude: self.amplitude,
                frequency_hz: self.frequency_hz,
                noise: self.noise,
            },
        };
        Some(Arc::new(SimulatedDriver::new(&params.serial, kind, signal)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_driver_reports_only_while_connected() {
        let driver = SimulatedDriver::constant("SIM-1", 3.5);
        assert!(driver.read().is_none());
        driver.connect(Duration::from_millis(100)).unwrap();
        assert_eq!(driver.read(), Some(Reading::Scalar(3.5)));
        driver.disconnect();
        assert!(driver.read().is_none());
        assert_eq!(driver.connect_attempts(), 1);
    }

    #[test]
    fn slow_device_times_out() {
        let driver = SimulatedDriver::constant("SIM-2", 0.0)
            .with_connect_delay(Duration::from_millis(200));
        let err = driver.connect(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert!(!driver.is_connected());
    }

    #[test]
    fn factory_honours_offline_flag() {
        let factory = SimulatedDriverFactory::default();
        let mut params = ConnectionParams {
            serial: "SIM-3".into(),
            channel: Some(0),
            ..Default::default()
        };
        params
            .properties
            .insert("offline".into(), serde_json::Value::from(true));
        let driver = factory.create(SensorType::LoadCell, &params).unwrap();
        assert!(driver.connect(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn sine_imu_updates_in_background() {
        let factory = SimulatedDriverFactory::default();
        let params = ConnectionParams {
            serial: "SIM-IMU".into(),
            ..Default::default()
        };
        let driver = factory.create(SensorType::Imu, &params).unwrap();
        driver.connect(Duration::from_millis(50)).unwrap();
        thread::sleep(Duration::from_millis(10));
        match driver.read() {
            Some(Reading::Imu(imu)) => {
                let norm: f64 = imu.orientation.iter().map(|v| v * v).sum();
                assert!((norm - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected reading {other:?}"),
        }
        driver.disconnect();
    }
}
