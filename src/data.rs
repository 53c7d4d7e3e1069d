// src/data.rs
use std::collections::BTreeSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::group::SensorGroup;
use crate::processing::{
    center_of_pressure, confidence_ellipse, fill_gaps, quaternion_to_euler_deg, sum_columns,
    ButterworthFilter, CenterOfPressure, ConfidenceEllipse, DataFrame, FrequencySpectrum,
    PlatformForces, PlatformGeometry, SpectrumBuilder,
};
use crate::types::{
    GroupStatus, GroupType, Reading, SensorType, IMU_CHANNELS, PLATFORM_AXES, PLATFORM_CORNERS,
    PLATFORM_LABELS,
};

/// Everything recorded by one session, as saved to disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    /// Milliseconds since the Unix epoch, one per tick.
    pub timestamps: Vec<u64>,
    pub raw: DataFrame,
    pub calibrated: DataFrame,
    pub filtered: DataFrame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Raw,
    Calibrated,
    Filtered,
}

/// Plot-ready series for one plot identifier.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum FigureData {
    Series {
        title: String,
        time_s: Vec<f64>,
        lines: Vec<(String, Vec<f64>)>,
    },
    Cop {
        title: String,
        cop: CenterOfPressure,
        ellipse: Option<ConfidenceEllipse>,
    },
}

#[derive(Clone, Debug)]
enum PlotKind {
    Sensor { kind: SensorType, headers: Vec<String> },
    Forces { platform: usize },
    Cop { platform: usize },
}

#[derive(Clone, Debug)]
struct PlotOption {
    id: String,
    title: String,
    kind: PlotKind,
}

/// Axis-labelled platform columns, indexed like `PLATFORM_LABELS`.
#[derive(Clone, Debug)]
struct PlatformLayout {
    name: String,
    slots: Vec<Option<String>>,
}

impl PlatformLayout {
    fn axis_headers(&self, axis: usize) -> Vec<String> {
        self.slots[axis * PLATFORM_CORNERS..(axis + 1) * PLATFORM_CORNERS]
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn valid_headers(&self) -> Vec<String> {
        self.slots.iter().flatten().cloned().collect()
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Turns recorded sensor values into raw, calibrated and filtered frames plus
/// derived platform metrics.
#[derive(Clone, Debug, Default)]
pub struct DataManager {
    results: TestResults,
    geometry: PlatformGeometry,
    plots: Vec<PlotOption>,
    platforms: Vec<PlatformLayout>,
}

impl DataManager {
    pub fn new(geometry: PlatformGeometry) -> Self {
        Self {
            geometry,
            ..Default::default()
        }
    }

    /// Replaces all frames with the values recorded by `groups`.
    ///
    /// Sensors whose value count differs from the timeline are dropped.
    pub fn load_data(&mut self, timestamps: &[u64], groups: &[SensorGroup]) -> Result<()> {
        self.results = TestResults {
            timestamps: timestamps.to_vec(),
            ..Default::default()
        };
        self.plots.clear();
        self.platforms.clear();

        let mut raw = Vec::new();
        let mut calibrated = Vec::new();
        let mut seen = BTreeSet::new();
        for group in groups {
            if !group.read() || group.status() == GroupStatus::Error {
                debug!("group {} skipped ({:?})", group.id(), group.status());
                continue;
            }
            let mut layout = PlatformLayout {
                name: group.name().to_string(),
                slots: vec![None; PLATFORM_LABELS.len()],
            };
            for sensor in group.sensors(true, None) {
                if sensor.values().len() != timestamps.len() {
                    warn!(
                        "{}: {} values for {} ticks, column dropped",
                        sensor.name(),
                        sensor.values().len(),
                        timestamps.len()
                    );
                    continue;
                }
                if !seen.insert(sensor.name().to_string()) {
                    warn!("{}: duplicate sensor name, column dropped", sensor.name());
                    continue;
                }
                let headers = match sensor.kind() {
                    SensorType::Imu => {
                        let columns = imu_columns(sensor.name(), sensor.values());
                        let headers: Vec<String> = columns.iter().map(|(h, _)| h.clone()).collect();
                        calibrated.extend(columns.iter().cloned());
                        raw.extend(columns);
                        headers
                    }
                    _ => {
                        let values: Vec<f64> = sensor.values().iter().map(scalar).collect();
                        let calibrated_values = values.iter().map(|v| sensor.calibrate(*v)).collect();
                        raw.push((sensor.name().to_string(), values));
                        calibrated.push((sensor.name().to_string(), calibrated_values));
                        vec![sensor.name().to_string()]
                    }
                };
                self.plots.push(PlotOption {
                    id: format!("{}/{}", group.id(), sensor.id()),
                    title: sensor.name().to_string(),
                    kind: PlotKind::Sensor {
                        kind: sensor.kind(),
                        headers,
                    },
                });
                if group.kind() == GroupType::Platform && sensor.kind() == SensorType::LoadCell {
                    if let Some(slot) = PLATFORM_LABELS
                        .iter()
                        .position(|label| sensor.name().contains(label.as_str()))
                    {
                        layout.slots[slot].get_or_insert_with(|| sensor.name().to_string());
                    }
                }
            }
            if group.kind() == GroupType::Platform {
                self.register_platform(group.id(), layout);
            }
        }
        self.results.raw = DataFrame::from_columns(raw)?;
        self.results.calibrated = DataFrame::from_columns(calibrated)?;
        Ok(())
    }

    fn register_platform(&mut self, group_id: &str, layout: PlatformLayout) {
        if layout.slots.iter().all(Option::is_none) {
            return;
        }
        let platform = self.platforms.len();
        self.plots.push(PlotOption {
            id: format!("{group_id}/forces"),
            title: format!("{} forces", layout.name),
            kind: PlotKind::Forces { platform },
        });
        if layout.is_complete() {
            self.plots.push(PlotOption {
                id: format!("{group_id}/cop"),
                title: format!("{} COP", layout.name),
                kind: PlotKind::Cop { platform },
            });
        }
        self.platforms.push(layout);
    }

    /// Zero-phase low-pass of every calibrated column.
    ///
    /// Missed samples are interpolated first; a column with no finite sample
    /// at all stays as recorded.
    pub fn apply_butter_filter(&mut self, sample_rate_hz: f64, cutoff_hz: f64, order: usize) -> Result<()> {
        self.results.filtered = DataFrame::default();
        let filter = ButterworthFilter::lowpass(order, cutoff_hz, sample_rate_hz)?;
        self.results.filtered = self.results.calibrated.map_columns(|header, column| {
            let mut column = column.to_vec();
            match fill_gaps(&mut column) {
                Some(0) => {}
                Some(n) => debug!("{header}: {n} missed samples interpolated"),
                None => {
                    warn!("{header}: no valid sample, left unfiltered");
                    return Ok(column);
                }
            }
            filter.filtfilt(&column)
        })?;
        Ok(())
    }

    pub fn frame(&self, kind: FrameKind, window: Option<(usize, usize)>) -> Result<DataFrame> {
        let frame = match kind {
            FrameKind::Raw => &self.results.raw,
            FrameKind::Calibrated => &self.results.calibrated,
            FrameKind::Filtered => &self.results.filtered,
        };
        match window {
            Some((start, end)) => frame.window(start, end),
            None => Ok(frame.clone()),
        }
    }

    pub fn raw_frame(&self, window: Option<(usize, usize)>) -> Result<DataFrame> {
        self.frame(FrameKind::Raw, window)
    }

    pub fn calibrated_frame(&self, window: Option<(usize, usize)>) -> Result<DataFrame> {
        self.frame(FrameKind::Calibrated, window)
    }

    pub fn filtered_frame(&self, window: Option<(usize, usize)>) -> Result<DataFrame> {
        self.frame(FrameKind::Filtered, window)
    }

    /// Headers plus `%.6e` rows, for display or export.
    pub fn format_frame(
        &self,
        kind: FrameKind,
        window: Option<(usize, usize)>,
    ) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let frame = self.frame(kind, window)?;
        Ok((frame.headers().to_vec(), frame.formatted()))
    }

    pub fn timestamps(&self) -> &[u64] {
        &self.results.timestamps
    }

    /// Seconds since the first tick.
    pub fn time_since_start(&self) -> Vec<f64> {
        let first = self.results.timestamps.first().copied().unwrap_or(0);
        self.results
            .timestamps
            .iter()
            .map(|t| t.saturating_sub(first) as f64 / 1000.0)
            .collect()
    }

    /// Mean tick rate of the recording.
    pub fn sample_rate_hz(&self) -> Option<f64> {
        let ts = &self.results.timestamps;
        let (first, last) = (*ts.first()?, *ts.last()?);
        (last > first).then(|| (ts.len() - 1) as f64 * 1000.0 / (last - first) as f64)
    }

    /// Filtered frame when available, calibrated otherwise.
    pub fn analysis_frame(&self) -> &DataFrame {
        if self.results.filtered.is_empty() {
            &self.results.calibrated
        } else {
            &self.results.filtered
        }
    }

    /// Per-axis sums over the given columns, grouped by their `_X_`/`_Y_`/`_Z_` label.
    pub fn platform_forces(&self, headers: &[String]) -> PlatformForces {
        let axis_sum = |axis: char| {
            let marker = format!("_{axis}_");
            let selected: Vec<String> = headers.iter().filter(|h| h.contains(&marker)).cloned().collect();
            match self.analysis_frame().select(&selected) {
                Some(frame) if !selected.is_empty() => sum_columns(&frame),
                _ => Vec::new(),
            }
        };
        PlatformForces {
            fx: axis_sum(PLATFORM_AXES[0]),
            fy: axis_sum(PLATFORM_AXES[1]),
            fz: axis_sum(PLATFORM_AXES[2]),
        }
    }

    /// COP of a complete platform group, `None` otherwise or when the vertical
    /// force vanishes.
    pub fn platform_cop(&self, group_id: &str) -> Option<CenterOfPressure> {
        let layout = self.layout(group_id)?;
        if !layout.is_complete() {
            return None;
        }
        let frame = self.analysis_frame();
        let fx = frame.select(&layout.axis_headers(0))?;
        let fy = frame.select(&layout.axis_headers(1))?;
        let fz = frame.select(&layout.axis_headers(2))?;
        center_of_pressure(&fx, &fy, &fz, &self.geometry)
    }

    pub fn ellipse(&self, group_id: &str) -> Option<ConfidenceEllipse> {
        confidence_ellipse(&self.platform_cop(group_id)?)
    }

    fn layout(&self, group_id: &str) -> Option<&PlatformLayout> {
        self.plots.iter().find_map(|plot| match plot.kind {
            PlotKind::Forces { platform } if plot.id == format!("{group_id}/forces") => {
                self.platforms.get(platform)
            }
            _ => None,
        })
    }

    /// Euler angles of an IMU, as `<sensor>_yaw`, `<sensor>_pitch`, `<sensor>_roll`.
    pub fn imu_angles(&self, sensor: &str) -> Option<DataFrame> {
        let frame = self.analysis_frame();
        let q: Vec<Vec<f64>> = IMU_CHANNELS[..4]
            .iter()
            .map(|suffix| frame.column_vec(&format!("{sensor}_{suffix}")))
            .collect::<Option<_>>()?;
        let (mut yaw, mut pitch, mut roll) = (Vec::new(), Vec::new(), Vec::new());
        for row in 0..frame.n_rows() {
            let [r, p, y] = quaternion_to_euler_deg(q[0][row], q[1][row], q[2][row], q[3][row]);
            roll.push(r);
            pitch.push(p);
            yaw.push(y);
        }
        DataFrame::from_columns(vec![
            (format!("{sensor}_yaw"), yaw),
            (format!("{sensor}_pitch"), pitch),
            (format!("{sensor}_roll"), roll),
        ])
        .ok()
    }

    pub fn plot_options(&self) -> Vec<String> {
        self.plots.iter().map(|plot| plot.id.clone()).collect()
    }

    pub fn figure_data(&self, id: &str) -> Option<FigureData> {
        let plot = self.plots.iter().find(|plot| plot.id == id)?;
        let title = plot.title.clone();
        match &plot.kind {
            PlotKind::Sensor { kind: SensorType::Imu, .. } => {
                let angles = self.imu_angles(&plot.title)?;
                Some(FigureData::Series {
                    title,
                    time_s: self.time_since_start(),
                    lines: frame_lines(&angles),
                })
            }
            PlotKind::Sensor { headers, .. } => {
                let frame = self.analysis_frame().select(headers)?;
                Some(FigureData::Series {
                    title,
                    time_s: self.time_since_start(),
                    lines: frame_lines(&frame),
                })
            }
            PlotKind::Forces { platform } => {
                let forces = self.platform_forces(&self.platforms.get(*platform)?.valid_headers());
                let lines = [("Fx", forces.fx), ("Fy", forces.fy), ("Fz", forces.fz)]
                    .into_iter()
                    .filter(|(_, v)| !v.is_empty())
                    .map(|(label, v)| (label.to_string(), v))
                    .collect();
                Some(FigureData::Series {
                    title,
                    time_s: self.time_since_start(),
                    lines,
                })
            }
            PlotKind::Cop { .. } => {
                let group_id = id.strip_suffix("/cop")?;
                let cop = self.platform_cop(group_id)?;
                let ellipse = confidence_ellipse(&cop);
                Some(FigureData::Cop {
                    title,
                    cop,
                    ellipse,
                })
            }
        }
    }

    /// Magnitude spectrum of one analysis column.
    pub fn spectrum(&self, header: &str, fft_size: usize) -> Option<FrequencySpectrum> {
        let column = self.analysis_frame().column_vec(header)?;
        let sample_rate = self.sample_rate_hz()?;
        Some(SpectrumBuilder::with_size(fft_size).compute(header, &column, sample_rate))
    }

    pub fn results(&self) -> &TestResults {
        &self.results
    }

    pub fn geometry(&self) -> &PlatformGeometry {
        &self.geometry
    }
}

fn scalar(reading: &Reading) -> f64 {
    reading.as_scalar().unwrap_or(f64::NAN)
}

fn imu_columns(name: &str, values: &[Reading]) -> Vec<(String, Vec<f64>)> {
    let rows: Vec<[f64; 10]> = values
        .iter()
        .map(|reading| match reading {
            Reading::Imu(imu) => imu.flatten(),
            Reading::Scalar(_) => [f64::NAN; 10],
        })
        .collect();
    IMU_CHANNELS
        .iter()
        .enumerate()
        .map(|(i, suffix)| (format!("{name}_{suffix}"), rows.iter().map(|r| r[i]).collect()))
        .collect()
}

fn frame_lines(frame: &DataFrame) -> Vec<(String, Vec<f64>)> {
    frame
        .columns()
        .map(|(header, column)| (header.to_string(), column.to_vec()))
        .collect()
}
