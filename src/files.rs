// src/files.rs
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use csv::{ReaderBuilder, Writer};
use log::{info, warn};

use crate::data::TestResults;
use crate::error::{AcquisitionError, Result};
use crate::processing::{format_scientific, DataFrame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// `timestamp` plus one `%.6e` column per header.
    Csv,
    /// Full `TestResults`, exact round trip.
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format {other}")),
        }
    }
}

/// Saves and loads session results inside one output folder.
pub struct FileManager {
    folder: PathBuf,
}

impl FileManager {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// `name`, or `name_1`, `name_2`, ... when `name.<ext>` already exists.
    pub fn check_duplicated_name(&self, name: &str, extension: &str) -> String {
        let taken = |candidate: &str| self.folder.join(format!("{candidate}.{extension}")).exists();
        if !taken(name) {
            return name.to_string();
        }
        (1..)
            .map(|i| format!("{name}_{i}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    fn target(&self, name: &str, format: OutputFormat) -> Option<PathBuf> {
        if !self.folder.is_dir() {
            warn!("output folder {} does not exist, nothing saved", self.folder.display());
            return None;
        }
        let name = self.check_duplicated_name(name, format.extension());
        Some(self.folder.join(format!("{name}.{}", format.extension())))
    }

    /// Writes the results; `Ok(None)` when the output folder is missing.
    ///
    /// CSV holds the filtered frame, or the calibrated one when nothing was filtered.
    pub fn save_results(&self, name: &str, results: &TestResults, format: OutputFormat) -> Result<Option<PathBuf>> {
        let Some(path) = self.target(name, format) else {
            return Ok(None);
        };
        match format {
            OutputFormat::Csv => {
                let frame = if results.filtered.is_empty() {
                    &results.calibrated
                } else {
                    &results.filtered
                };
                write_csv(&path, &results.timestamps, frame)?;
            }
            OutputFormat::Json => {
                let mut writer = BufWriter::new(File::create(&path)?);
                serde_json::to_writer(&mut writer, results)?;
                writer.flush()?;
            }
        }
        info!("💾 results saved to {}", path.display());
        Ok(Some(path))
    }

    pub fn load_results(path: impl AsRef<Path>) -> Result<TestResults> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load_csv(path: impl AsRef<Path>) -> Result<(Vec<u64>, DataFrame)> {
        let path = path.as_ref();
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some("timestamp") {
            return Err(AcquisitionError::Format(format!(
                "{}: first column must be timestamp",
                path.display()
            )));
        }
        let mut timestamps: Vec<u64> = Vec::new();
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len() - 1];
        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            let bad = |field: &str| {
                AcquisitionError::Format(format!("row {}: invalid value {field:?}", row_idx + 1))
            };
            let timestamp = &record[0];
            timestamps.push(timestamp.parse().map_err(|_| bad(timestamp))?);
            for (column, field) in columns.iter_mut().zip(record.iter().skip(1)) {
                column.push(field.parse().map_err(|_| bad(field))?);
            }
        }
        let frame = DataFrame::from_columns(headers.iter().skip(1).map(String::from).zip(columns).collect())?;
        Ok((timestamps, frame))
    }
}

fn write_csv(path: &Path, timestamps: &[u64], frame: &DataFrame) -> Result<()> {
    if timestamps.len() != frame.n_rows() && !frame.is_empty() {
        return Err(AcquisitionError::ColumnLength {
            header: "timestamp".into(),
            expected: frame.n_rows(),
            actual: timestamps.len(),
        });
    }
    let mut writer = Writer::from_writer(BufWriter::new(File::create(path)?));
    writer.write_record(std::iter::once("timestamp").chain(frame.headers().iter().map(String::as_str)))?;
    let rows = frame.formatted();
    for (i, timestamp) in timestamps.iter().enumerate() {
        let mut record = vec![timestamp.to_string()];
        if let Some(row) = rows.get(i) {
            record.extend(row.iter().cloned());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
