// src/drivers/mod.rs
pub mod error;
pub mod serial;
pub mod simulated;
pub mod source;
pub use error::DriverError;
pub use serial::{SerialDriverFactory, SerialLineDriver};
pub use simulated::{SimulatedDriver, SimulatedDriverFactory, SimulatedSignal};
pub use source::{ConnectionParams, DriverFactory, ReadingCell, SensorDriver};
