use rustfft::{num_complex::Complex64, FftPlanner};
use serde::Serialize;

/// Magnitude spectrum of one column.
#[derive(Clone, Debug, Serialize)]
pub struct FrequencySpectrum {
    pub label: String,
    pub sample_rate_hz: f64,
    pub frequencies_hz: Vec<f64>,
    pub magnitudes: Vec<f64>,
}

/// Helper that computes FFTs for a given window size.
pub struct SpectrumBuilder {
    fft_size: usize,
}

impl SpectrumBuilder {
    pub fn with_size(fft_size: usize) -> Self {
        Self {
            fft_size: fft_size.max(2),
        }
    }

    /// Uses the first `fft_size` samples, zero-padded; non-finite samples count as zero.
    pub fn compute(&self, label: &str, samples: &[f64], sample_rate_hz: f64) -> FrequencySpectrum {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(self.fft_size);
        let frequencies_hz = (0..self.fft_size / 2)
            .map(|k| k as f64 * sample_rate_hz / self.fft_size as f64)
            .collect();
        let mut buffer: Vec<Complex64> = samples
            .iter()
            .take(self.fft_size)
            .map(|v| Complex64::new(if v.is_finite() { *v } else { 0.0 }, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex64::new(0.0, 0.0));
        fft.process(&mut buffer);
        let magnitudes = buffer
            .iter()
            .take(self.fft_size / 2)
            .map(|c| c.norm() / self.fft_size as f64)
            .collect();
        FrequencySpectrum {
            label: label.to_string(),
            sample_rate_hz,
            frequencies_hz,
            magnitudes,
        }
    }
}
