use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::drivers::{ConnectionParams, DriverError, DriverFactory, SensorDriver};
use crate::types::{ImuReading, Reading, SensorType, IMU_CHANNELS};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

type LatestFields = Arc<Mutex<Option<Vec<f64>>>>;

/// One open port, shared by every channel configured on it.
///
/// The reader thread parses each line once; channels pick their fields from
/// the latest parsed line. The port closes when its last channel disconnects.
struct SharedPort {
    path: String,
    baud_rate: u32,
    users: Mutex<usize>,
    running: Arc<AtomicBool>,
    fields: LatestFields,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SharedPort {
    fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            users: Mutex::new(0),
            running: Arc::new(AtomicBool::new(false)),
            fields: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }

    fn acquire(&self, timeout: Duration) -> Result<(), DriverError> {
        let mut users = self.users.lock();
        if *users == 0 || !self.running.load(Ordering::SeqCst) {
            self.close();
            self.open(timeout)?;
        }
        *users += 1;
        Ok(())
    }

    fn release(&self) {
        let mut users = self.users.lock();
        *users = users.saturating_sub(1);
        if *users == 0 {
            self.close();
        }
    }

    fn open(&self, timeout: Duration) -> Result<(), DriverError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(timeout.min(READ_TIMEOUT))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(ErrorKind::NotFound) => DriverError::NotFound {
                    serial: self.path.clone(),
                },
                _ => DriverError::Serial(e),
            })?;
        debug!("opened {} at {} baud", self.path, self.baud_rate);
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let fields = Arc::clone(&self.fields);
        let path = self.path.clone();
        *self.reader.lock() = Some(thread::spawn(move || {
            let mut lines = BufReader::new(port);
            let mut line = Vec::new();
            while running.load(Ordering::SeqCst) {
                if let Err(e) = read_step(&mut lines, &mut line, &fields) {
                    warn!("{path}: read failed, closing port: {e}");
                    running.store(false, Ordering::SeqCst);
                }
            }
        }));
        Ok(())
    }

    fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        *self.fields.lock() = None;
    }

    fn latest(&self) -> Option<Vec<f64>> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        self.fields.lock().clone()
    }
}

impl Drop for SharedPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads towards the next newline. A partial line survives read timeouts and
/// is completed by the following call.
fn read_step<R: BufRead>(reader: &mut R, line: &mut Vec<u8>, fields: &Mutex<Option<Vec<f64>>>) -> std::io::Result<()> {
    match reader.read_until(b'\n', line) {
        Ok(_) if line.ends_with(b"\n") => {
            if let Some(parsed) = std::str::from_utf8(line).ok().and_then(parse_fields) {
                *fields.lock() = Some(parsed);
            }
            line.clear();
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::TimedOut => Ok(()),
        Err(e) => Err(e),
    }
}

/// Splits one line of the device stream into numeric fields.
pub(crate) fn parse_fields(line: &str) -> Option<Vec<f64>> {
    line.trim()
        .split(',')
        .map(|f| f.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()
}

/// Reading for one channel of a parsed line.
pub(crate) fn pick_channel(kind: SensorType, channel: usize, offset: f64, fields: &[f64]) -> Option<Reading> {
    match kind {
        SensorType::Imu => {
            let end = channel + IMU_CHANNELS.len();
            ImuReading::from_slice(fields.get(channel..end)?).map(Reading::Imu)
        }
        _ => fields.get(channel).map(|v| Reading::Scalar(v + offset)),
    }
}

/// One channel of a device streaming comma-separated ASCII lines.
///
/// Scalar sensors pick field `channel`; IMUs take ten consecutive fields
/// starting at `channel` (default 0).
pub struct SerialLineDriver {
    port: Arc<SharedPort>,
    kind: SensorType,
    channel: usize,
    offset: f64,
    connected: AtomicBool,
}

impl SerialLineDriver {
    fn new(port: Arc<SharedPort>, params: &ConnectionParams, kind: SensorType) -> Self {
        let offset = match kind {
            SensorType::Encoder => params.initial_position.unwrap_or(0.0),
            _ => 0.0,
        };
        Self {
            port,
            kind,
            channel: params.channel.unwrap_or(0) as usize,
            offset,
            connected: AtomicBool::new(false),
        }
    }
}

impl SensorDriver for SerialLineDriver {
    fn connect(&self, timeout: Duration) -> Result<(), DriverError> {
        if self.is_connected() {
            return Ok(());
        }
        self.port.acquire(timeout)?;
        if self.connected.swap(true, Ordering::SeqCst) {
            self.port.release();
        }
        Ok(())
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.port.release();
        }
    }

    fn read(&self) -> Option<Reading> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        pick_channel(self.kind, self.channel, self.offset, &self.port.latest()?)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.port.running.load(Ordering::SeqCst)
    }
}

impl Drop for SerialLineDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Builds serial channels; sensors naming the same port and baud rate share
/// one open port.
#[derive(Clone)]
pub struct SerialDriverFactory {
    pub default_baud_rate: u32,
    ports: Arc<Mutex<HashMap<(String, u32), Arc<SharedPort>>>>,
}

impl Default for SerialDriverFactory {
    fn default() -> Self {
        Self {
            default_baud_rate: 115_200,
            ports: Arc::default(),
        }
    }
}

impl SerialDriverFactory {
    fn channel(&self, kind: SensorType, params: &ConnectionParams) -> Option<SerialLineDriver> {
        if params.serial.is_empty() {
            return None;
        }
        let baud_rate = params
            .property_f64("baud_rate")
            .map(|b| b as u32)
            .unwrap_or(self.default_baud_rate);
        let port = self
            .ports
            .lock()
            .entry((params.serial.clone(), baud_rate))
            .or_insert_with(|| Arc::new(SharedPort::new(&params.serial, baud_rate)))
            .clone();
        Some(SerialLineDriver::new(port, params, kind))
    }
}

impl DriverFactory for SerialDriverFactory {
    fn create(&self, kind: SensorType, params: &ConnectionParams) -> Option<Arc<dyn SensorDriver>> {
        self.channel(kind, params)
            .map(|driver| Arc::new(driver) as Arc<dyn SensorDriver>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{self, Read};

    fn parse_line(kind: SensorType, channel: usize, offset: f64, line: &str) -> Option<Reading> {
        pick_channel(kind, channel, offset, &parse_fields(line)?)
    }

    /// Hands out queued chunks; an `Err` entry fails that one read.
    struct Chunks(VecDeque<Result<&'static [u8], ErrorKind>>);

    impl Read for Chunks {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    out[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                }
                Some(Err(kind)) => Err(io::Error::from(kind)),
                None => Ok(0),
            }
        }
    }

    fn params(serial: &str, channel: u32) -> ConnectionParams {
        ConnectionParams {
            serial: serial.into(),
            channel: Some(channel),
            ..Default::default()
        }
    }

    #[test]
    fn scalar_line_picks_channel_field() {
        let reading = parse_line(SensorType::LoadCell, 2, 0.0, "0.5, 1.5, 2.5\r\n");
        assert_eq!(reading, Some(Reading::Scalar(2.5)));
        assert_eq!(parse_line(SensorType::LoadCell, 3, 0.0, "0.5,1.5,2.5"), None);
    }

    #[test]
    fn encoder_line_adds_initial_position() {
        let reading = parse_line(SensorType::Encoder, 0, 10.0, "4");
        assert_eq!(reading, Some(Reading::Scalar(14.0)));
    }

    #[test]
    fn imu_line_needs_ten_fields() {
        let line = "0,0,0,1,0.1,0.2,0.3,0,0,9.81";
        match parse_line(SensorType::Imu, 0, 0.0, line) {
            Some(Reading::Imu(imu)) => {
                assert_eq!(imu.orientation, [0.0, 0.0, 0.0, 1.0]);
                assert_eq!(imu.linear_acceleration[2], 9.81);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_line(SensorType::Imu, 0, 0.0, "0,0,0,1"), None);
    }

    #[test]
    fn garbage_lines_are_dropped() {
        assert_eq!(parse_line(SensorType::LoadCell, 0, 0.0, "hello"), None);
    }

    #[test]
    fn missing_port_is_reported() {
        let factory = SerialDriverFactory::default();
        let driver = factory
            .create(SensorType::LoadCell, &params("/dev/definitely-not-a-port", 0))
            .unwrap();
        assert!(driver.connect(Duration::from_millis(20)).is_err());
        assert!(!driver.is_connected());
        assert!(driver.read().is_none());
    }

    #[test]
    fn channels_on_one_port_share_the_reader() {
        let factory = SerialDriverFactory::default();
        let first = factory.channel(SensorType::LoadCell, &params("/dev/ttyFP0", 0)).unwrap();
        let third = factory.channel(SensorType::LoadCell, &params("/dev/ttyFP0", 2)).unwrap();
        let other = factory.channel(SensorType::LoadCell, &params("/dev/ttyFP1", 0)).unwrap();
        assert!(Arc::ptr_eq(&first.port, &third.port));
        assert!(!Arc::ptr_eq(&first.port, &other.port));
        assert_eq!(factory.ports.lock().len(), 2);

        first.port.running.store(true, Ordering::SeqCst);
        *first.port.fields.lock() = parse_fields("0.5,1.5,2.5");
        first.connected.store(true, Ordering::SeqCst);
        third.connected.store(true, Ordering::SeqCst);
        assert_eq!(first.read(), Some(Reading::Scalar(0.5)));
        assert_eq!(third.read(), Some(Reading::Scalar(2.5)));
        assert!(other.read().is_none());
        first.port.running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn timeout_mid_line_keeps_the_partial_line() {
        let mut reader = BufReader::new(Chunks(VecDeque::from([
            Ok(&b"1.0,2."[..]),
            Err(ErrorKind::TimedOut),
            Ok(&b"5,3.0\n4.0,"[..]),
            Err(ErrorKind::TimedOut),
        ])));
        let fields = Mutex::new(None);
        let mut line = Vec::new();
        read_step(&mut reader, &mut line, &fields).unwrap();
        assert!(fields.lock().is_none());
        assert_eq!(line, b"1.0,2.");
        read_step(&mut reader, &mut line, &fields).unwrap();
        assert_eq!(*fields.lock(), Some(vec![1.0, 2.5, 3.0]));
        read_step(&mut reader, &mut line, &fields).unwrap();
        assert_eq!(line, b"4.0,");
        assert_eq!(*fields.lock(), Some(vec![1.0, 2.5, 3.0]));
    }

    #[test]
    fn broken_stream_is_reported() {
        let mut reader = BufReader::new(Chunks(VecDeque::from([Err(ErrorKind::BrokenPipe)])));
        let fields = Mutex::new(None);
        assert!(read_step(&mut reader, &mut Vec::new(), &fields).is_err());
    }
}
