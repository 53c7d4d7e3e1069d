// src/calibrator.rs
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// One closed calibration trial.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Known load applied during the trial.
    pub reference: f64,
    pub mean: f64,
    /// Population standard deviation of the samples.
    pub std: f64,
    pub count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    pub slope: f64,
    pub intercept: f64,
    pub r2: f64,
}

/// Interactive linear calibration of one sensor.
///
/// Each trial collects raw samples under a known reference load; the fit maps
/// measured means onto references, so its slope/intercept can be written to
/// the sensor as they are.
#[derive(Clone, Debug, Default)]
pub struct SensorCalibrator {
    sensor_id: String,
    reference: Option<f64>,
    buffer: Vec<f64>,
    trials: Vec<TrialResult>,
}

impl SensorCalibrator {
    pub fn new(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            ..Default::default()
        }
    }

    pub fn new_calibration_test(&mut self, reference: f64) {
        self.reference = Some(reference);
        self.buffer.clear();
    }

    /// Ignored when no trial is open or the sample is not finite.
    pub fn add_test_measurement(&mut self, value: f64) -> bool {
        if self.reference.is_none() || !value.is_finite() {
            return false;
        }
        self.buffer.push(value);
        true
    }

    pub fn is_measuring(&self) -> bool {
        self.reference.is_some()
    }

    /// Closes the open trial. `None` when nothing was measured.
    pub fn get_test_results(&mut self) -> Option<TrialResult> {
        let reference = self.reference.take()?;
        let samples = std::mem::take(&mut self.buffer);
        if samples.is_empty() {
            warn!("{}: calibration trial at {reference} has no samples", self.sensor_id);
            return None;
        }
        let count = samples.len();
        let mean = samples.iter().sum::<f64>() / count as f64;
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let result = TrialResult {
            reference,
            mean,
            std: variance.sqrt(),
            count,
        };
        debug!("{}: trial {result:?}", self.sensor_id);
        self.trials.push(result);
        Some(result)
    }

    /// Least squares of reference load against measured mean over all trials.
    pub fn get_calibration_results(&self) -> Option<CalibrationFit> {
        if self.trials.len() < 2 {
            return None;
        }
        let n = self.trials.len() as f64;
        let mean_x = self.trials.iter().map(|t| t.mean).sum::<f64>() / n;
        let mean_y = self.trials.iter().map(|t| t.reference).sum::<f64>() / n;
        let (mut sxx, mut sxy) = (0.0, 0.0);
        for t in &self.trials {
            sxx += (t.mean - mean_x).powi(2);
            sxy += (t.mean - mean_x) * (t.reference - mean_y);
        }
        if sxx <= f64::EPSILON {
            return None;
        }
        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let (mut ss_res, mut ss_tot) = (0.0, 0.0);
        for t in &self.trials {
            ss_res += (t.reference - (slope * t.mean + intercept)).powi(2);
            ss_tot += (t.reference - mean_y).powi(2);
        }
        let r2 = if ss_tot <= f64::EPSILON {
            1.0
        } else {
            1.0 - ss_res / ss_tot
        };
        Some(CalibrationFit {
            slope,
            intercept,
            r2,
        })
    }

    pub fn trials(&self) -> &[TrialResult] {
        &self.trials
    }

    pub fn remove_trial(&mut self, index: usize) -> Option<TrialResult> {
        (index < self.trials.len()).then(|| self.trials.remove(index))
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.buffer.clear();
        self.trials.clear();
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }
}
