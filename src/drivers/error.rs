use thiserror::Error;

/// Failures at the hardware boundary. `Sensor` turns every variant into `NotFound`.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device {serial} not found")]
    NotFound { serial: String },
    #[error("connection to {serial} timed out after {timeout_ms}ms")]
    Timeout { serial: String, timeout_ms: u64 },
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
