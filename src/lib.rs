// src/lib.rs
pub mod calibrator;
pub mod config;
pub mod data;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod files;
pub mod group;
pub mod manager;
pub mod processing;
pub mod sensor;
pub mod session;
pub mod types;

pub use calibrator::{CalibrationFit, SensorCalibrator, TrialResult};
pub use config::{ConfigStore, Settings};
pub use data::{DataManager, FigureData, FrameKind, TestResults};
pub use error::{AcquisitionError, Result};
pub use files::{FileManager, OutputFormat};
pub use group::SensorGroup;
pub use manager::SensorManager;
pub use sensor::{Sensor, SensorParams};
pub use session::{AcquisitionSession, SessionState};
