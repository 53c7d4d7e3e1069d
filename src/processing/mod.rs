// src/processing/mod.rs
pub mod fft;
pub mod filter;
pub mod frame;
pub mod imu;
pub mod platform;
pub mod plot;
pub use fft::{FrequencySpectrum, SpectrumBuilder};
pub use filter::{fill_gaps, ButterworthFilter};
pub use frame::{format_scientific, DataFrame};
pub use imu::quaternion_to_euler_deg;
pub use platform::{
    center_of_pressure, confidence_ellipse, sum_columns, CenterOfPressure, ConfidenceEllipse,
    PlatformForces, PlatformGeometry,
};
pub use plot::{render_figure_png, PlotStyle};
