use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("acquisition session is already running")]
    AlreadyRunning,
    #[error("acquisition session is not running")]
    NotRunning,
    #[error("no sensor group has an available sensor")]
    NoSensorAvailable,
    #[error("invalid row window {start}..{end} for {len} rows")]
    InvalidWindow { start: usize, end: usize, len: usize },
    #[error("column {header} has {actual} rows, expected {expected}")]
    ColumnLength {
        header: String,
        expected: usize,
        actual: usize,
    },
    #[error("signal too short to filter: need more than {required} samples, have {available}")]
    SignalTooShort { required: usize, available: usize },
    #[error("invalid filter parameters: {0}")]
    InvalidFilter(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("malformed results file: {0}")]
    Format(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to render plot: {0}")]
    Plot(String),
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for AcquisitionError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        AcquisitionError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for AcquisitionError {
    fn from(value: image::ImageError) -> Self {
        AcquisitionError::Plot(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;
