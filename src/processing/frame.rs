use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{AcquisitionError, Result};

/// Column-labelled table of samples, one row per tick.
///
/// Serialized column-wise. NaN is stored as `null`, infinities as `"inf"` / `"-inf"`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "ColumnRepr", try_from = "ColumnRepr")]
pub struct DataFrame {
    headers: Vec<String>,
    values: Array2<f64>, // rows x columns
}

impl DataFrame {
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        for (header, column) in &columns {
            if column.len() != rows {
                return Err(AcquisitionError::ColumnLength {
                    header: header.clone(),
                    expected: rows,
                    actual: column.len(),
                });
            }
        }
        let values = Array2::from_shape_fn((rows, columns.len()), |(r, c)| columns[c].1[r]);
        let headers = columns.into_iter().map(|(h, _)| h).collect();
        Ok(Self { headers, values })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_cols(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn column(&self, header: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.headers.iter().position(|h| h == header)?;
        Some(self.values.column(idx))
    }

    pub fn column_vec(&self, header: &str) -> Option<Vec<f64>> {
        self.column(header).map(|c| c.to_vec())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, ArrayView1<'_, f64>)> {
        self.headers
            .iter()
            .map(String::as_str)
            .zip(self.values.axis_iter(Axis(1)))
    }

    /// Builds a new frame with every column transformed by `f`.
    pub fn map_columns<F>(&self, mut f: F) -> Result<Self>
    where
        F: FnMut(&str, ArrayView1<'_, f64>) -> Result<Vec<f64>>,
    {
        let columns = self
            .columns()
            .map(|(header, column)| Ok((header.to_string(), f(header, column)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_columns(columns)
    }

    /// Sub-frame with only the given headers, in the given order.
    pub fn select(&self, headers: &[String]) -> Option<Self> {
        let columns = headers
            .iter()
            .map(|h| self.column_vec(h).map(|c| (h.clone(), c)))
            .collect::<Option<Vec<_>>>()?;
        Self::from_columns(columns).ok()
    }

    /// Rows `start..end`; requires `start < end <= n_rows`.
    pub fn window(&self, start: usize, end: usize) -> Result<Self> {
        let len = self.n_rows();
        if start >= end || end > len {
            return Err(AcquisitionError::InvalidWindow { start, end, len });
        }
        Ok(Self {
            headers: self.headers.clone(),
            values: self.values.slice(ndarray::s![start..end, ..]).to_owned(),
        })
    }

    /// Display rows in `%.6e` notation.
    pub fn formatted(&self) -> Vec<Vec<String>> {
        self.values
            .axis_iter(Axis(0))
            .map(|row| row.iter().map(|v| format_scientific(*v)).collect())
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Sample {
    Number(f64),
    Infinite(String),
    Missing,
}

impl From<f64> for Sample {
    fn from(value: f64) -> Self {
        if value.is_nan() {
            Self::Missing
        } else if value.is_infinite() {
            Self::Infinite(if value > 0.0 { "inf" } else { "-inf" }.to_string())
        } else {
            Self::Number(value)
        }
    }
}

impl TryFrom<Sample> for f64 {
    type Error = AcquisitionError;

    fn try_from(sample: Sample) -> Result<f64> {
        match sample {
            Sample::Number(value) => Ok(value),
            Sample::Missing => Ok(f64::NAN),
            Sample::Infinite(text) => match text.as_str() {
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                _ => Err(AcquisitionError::Format(format!("unexpected sample {text:?}"))),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ColumnRepr {
    headers: Vec<String>,
    columns: Vec<Vec<Sample>>,
}

impl From<DataFrame> for ColumnRepr {
    fn from(frame: DataFrame) -> Self {
        let columns = frame
            .values
            .axis_iter(Axis(1))
            .map(|column| column.iter().map(|v| Sample::from(*v)).collect())
            .collect();
        Self {
            headers: frame.headers,
            columns,
        }
    }
}

impl TryFrom<ColumnRepr> for DataFrame {
    type Error = AcquisitionError;

    fn try_from(repr: ColumnRepr) -> Result<Self> {
        if repr.headers.len() != repr.columns.len() {
            return Err(AcquisitionError::Format(format!(
                "{} headers for {} columns",
                repr.headers.len(),
                repr.columns.len()
            )));
        }
        let columns = repr
            .headers
            .into_iter()
            .zip(repr.columns)
            .map(|(header, column)| {
                let values = column.into_iter().map(f64::try_from).collect::<Result<Vec<_>>>()?;
                Ok((header, values))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_columns(columns)
    }
}

/// Formats like C's `%.6e` (`1.234560e+02`).
pub fn format_scientific(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string().to_lowercase();
    }
    let text = format!("{value:.6e}");
    match text.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => text,
    }
}
