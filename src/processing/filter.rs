use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rustfft::num_complex::Complex64;

use crate::error::{AcquisitionError, Result};

/// Transfer function `b(z) / a(z)` of a digital low-pass Butterworth filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ButterworthFilter {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

impl ButterworthFilter {
    /// Designs the filter through the analog prototype and the bilinear transform.
    /// The normalized cutoff is `cutoff_hz / (0.5 * sample_rate_hz)`.
    pub fn lowpass(order: usize, cutoff_hz: f64, sample_rate_hz: f64) -> Result<Self> {
        if order == 0 {
            return Err(AcquisitionError::InvalidFilter(
                "order must be at least 1".into(),
            ));
        }
        if sample_rate_hz <= 0.0 {
            return Err(AcquisitionError::InvalidFilter(format!(
                "sample rate {sample_rate_hz} Hz"
            )));
        }
        let wn = cutoff_hz / (0.5 * sample_rate_hz);
        if !(wn > 0.0 && wn < 1.0) {
            return Err(AcquisitionError::InvalidFilter(format!(
                "normalized cutoff {wn} outside (0, 1)"
            )));
        }
        let n = order as f64;
        // Pre-warp with fs = 2 so the bilinear constant 2*fs is 4.
        let warped = 4.0 * (PI * wn / 2.0).tan();
        let analog_poles: Vec<Complex64> = (0..order)
            .map(|k| {
                let m = 2.0 * k as f64 - n + 1.0;
                -Complex64::from_polar(1.0, PI * m / (2.0 * n)) * warped
            })
            .collect();
        let fs2 = Complex64::new(4.0, 0.0);
        let digital_poles: Vec<Complex64> =
            analog_poles.iter().map(|p| (fs2 + p) / (fs2 - p)).collect();
        let denominator = analog_poles
            .iter()
            .fold(Complex64::new(1.0, 0.0), |acc, p| acc * (fs2 - p));
        let gain = warped.powi(order as i32) / denominator.re;
        let zeros = vec![Complex64::new(-1.0, 0.0); order];
        let b = poly(&zeros).iter().map(|c| c.re * gain).collect();
        let a = poly(&digital_poles).iter().map(|c| c.re).collect();
        Ok(Self { b, a })
    }

    /// One-pass filtering (transposed direct form II) from the given state.
    pub fn lfilter(&self, x: &[f64], initial_state: &[f64]) -> Vec<f64> {
        let (b, a) = (&self.b, &self.a);
        let mut z = initial_state.to_vec();
        let m = z.len();
        x.iter()
            .map(|&xi| {
                let y = b[0] * xi + z.first().copied().unwrap_or(0.0);
                for j in 0..m {
                    let next = if j + 1 < m { z[j + 1] } else { 0.0 };
                    z[j] = b[j + 1] * xi + next - a[j + 1] * y;
                }
                y
            })
            .collect()
    }

    /// Steady-state of the filter for a unit step input.
    pub fn steady_state(&self) -> Vec<f64> {
        let m = self.a.len().saturating_sub(1);
        if m == 0 {
            return Vec::new();
        }
        let (b, a) = (&self.b, &self.a);
        // (I - companion(a)^T) zi = b[1:] - a[1:] * b[0]
        let mut lhs = DMatrix::<f64>::identity(m, m);
        for i in 0..m {
            lhs[(i, 0)] += a[i + 1];
        }
        for i in 0..m - 1 {
            lhs[(i, i + 1)] -= 1.0;
        }
        let rhs = DVector::from_iterator(m, (0..m).map(|i| b[i + 1] - a[i + 1] * b[0]));
        lhs.lu()
            .solve(&rhs)
            .map(|zi| zi.iter().copied().collect())
            .unwrap_or_else(|| vec![0.0; m])
    }

    /// Zero-phase forward-backward filtering with odd extension at both ends.
    pub fn filtfilt(&self, x: &[f64]) -> Result<Vec<f64>> {
        let padlen = 3 * self.a.len().max(self.b.len());
        if x.len() <= padlen {
            return Err(AcquisitionError::SignalTooShort {
                required: padlen,
                available: x.len(),
            });
        }
        let extended = odd_extension(x, padlen);
        let zi = self.steady_state();
        let scaled = |v: f64| zi.iter().map(|z| z * v).collect::<Vec<_>>();

        let mut forward = self.lfilter(&extended, &scaled(extended[0]));
        forward.reverse();
        let mut backward = self.lfilter(&forward, &scaled(forward[0]));
        backward.reverse();
        Ok(backward[padlen..padlen + x.len()].to_vec())
    }
}

/// Replaces non-finite samples in place: linear interpolation between the
/// surrounding finite samples, nearest finite sample at either end.
///
/// Returns how many samples were replaced, or `None` when nothing is finite.
pub fn fill_gaps(x: &mut [f64]) -> Option<usize> {
    let finite: Vec<usize> = (0..x.len()).filter(|&i| x[i].is_finite()).collect();
    let (&first, &last) = (finite.first()?, finite.last()?);
    let filled = x.len() - finite.len();
    if filled == 0 {
        return Some(0);
    }
    let (head, tail) = (x[first], x[last]);
    x[..first].iter_mut().for_each(|v| *v = head);
    x[last + 1..].iter_mut().for_each(|v| *v = tail);
    for pair in finite.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if hi - lo < 2 {
            continue;
        }
        let (y0, y1) = (x[lo], x[hi]);
        let span = (hi - lo) as f64;
        for i in lo + 1..hi {
            x[i] = y0 + (y1 - y0) * (i - lo) as f64 / span;
        }
    }
    Some(filled)
}

fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for root in roots {
        let mut next = vec![Complex64::new(0.0, 0.0); coeffs.len() + 1];
        for (i, c) in coeffs.iter().enumerate() {
            next[i] += c;
            next[i + 1] -= c * root;
        }
        coeffs = next;
    }
    coeffs
}

fn odd_extension(x: &[f64], n: usize) -> Vec<f64> {
    let len = x.len();
    let (first, last) = (x[0], x[len - 1]);
    let mut out = Vec::with_capacity(len + 2 * n);
    out.extend((1..=n).rev().map(|i| 2.0 * first - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=n).map(|i| 2.0 * last - x[len - 1 - i]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64], tol: f64) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < tol)
    }

    #[test]
    fn second_order_design_matches_reference_coefficients() {
        // butter(2, 0.2)
        let f = ButterworthFilter::lowpass(2, 10.0, 100.0).unwrap();
        assert!(close(
            &f.b,
            &[0.067_455_273_889_071_9, 0.134_910_547_778_143_8, 0.067_455_273_889_071_9],
            1e-9
        ));
        assert!(close(&f.a, &[1.0, -1.142_980_502_539_901, 0.412_801_598_096_189], 1e-9));
    }

    #[test]
    fn dc_gain_is_unity() {
        for order in 1..=5 {
            let f = ButterworthFilter::lowpass(order, 6.0, 100.0).unwrap();
            let gain = f.b.iter().sum::<f64>() / f.a.iter().sum::<f64>();
            assert!((gain - 1.0).abs() < 1e-9, "order {order} gain {gain}");
        }
    }

    #[test]
    fn filtfilt_keeps_constant_signal() {
        let f = ButterworthFilter::lowpass(4, 5.0, 100.0).unwrap();
        let x = vec![3.0; 64];
        let y = f.filtfilt(&x).unwrap();
        assert!(close(&x, &y, 1e-9));
    }

    #[test]
    fn filtfilt_removes_nyquist_oscillation() {
        let f = ButterworthFilter::lowpass(2, 5.0, 100.0).unwrap();
        let x: Vec<f64> = (0..400)
            .map(|i| 1.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let y = f.filtfilt(&x).unwrap();
        for v in &y[100..300] {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn filtfilt_has_no_phase_lag() {
        let fs = 100.0;
        let f = ButterworthFilter::lowpass(2, 20.0, fs).unwrap();
        let x: Vec<f64> = (0..400)
            .map(|i| (2.0 * PI * 1.0 * i as f64 / fs).sin())
            .collect();
        let y = f.filtfilt(&x).unwrap();
        let peak_in = (100..200).max_by(|&a, &b| x[a].total_cmp(&x[b])).unwrap();
        let peak_out = (100..200).max_by(|&a, &b| y[a].total_cmp(&y[b])).unwrap();
        assert_eq!(peak_in, peak_out);
    }

    #[test]
    fn short_signal_is_rejected() {
        let f = ButterworthFilter::lowpass(2, 5.0, 100.0).unwrap();
        let err = f.filtfilt(&[1.0; 9]).unwrap_err();
        assert!(matches!(err, AcquisitionError::SignalTooShort { required: 9, .. }));
        assert!(f.filtfilt(&[1.0; 10]).is_ok());
    }

    #[test]
    fn gaps_are_interpolated_and_edges_held() {
        let mut x = vec![f64::NAN, 1.0, f64::NAN, f64::NAN, 4.0, f64::INFINITY];
        assert_eq!(fill_gaps(&mut x), Some(4));
        assert_eq!(x, vec![1.0, 1.0, 2.0, 3.0, 4.0, 4.0]);

        let mut clean = vec![1.0, 2.0];
        assert_eq!(fill_gaps(&mut clean), Some(0));
        assert!(fill_gaps(&mut [f64::NAN, f64::NAN]).is_none());
    }

    #[test]
    fn cutoff_above_nyquist_is_rejected() {
        assert!(ButterworthFilter::lowpass(2, 60.0, 100.0).is_err());
        assert!(ButterworthFilter::lowpass(0, 10.0, 100.0).is_err());
    }
}
