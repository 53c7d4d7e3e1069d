//! Force platform metrics.
//!
//! Corner order follows the `_<axis>_<corner>` sensor naming (1..4). Moments
//! about the plate centre:
//! `mx = ly/2 * (-fz1 - fz2 + fz3 + fz4)`, `my = lx/2 * (-fz1 + fz2 + fz3 - fz4)`,
//! and the centre of pressure is `((-h*fx - my) / fz, (-h*fy + mx) / fz)`.
use std::f64::consts::PI;

use nalgebra::{Matrix2, SymmetricEigen};
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

use crate::processing::DataFrame;
use crate::types::PLATFORM_CORNERS;

pub const ELLIPSE_POINTS: usize = 100;

/// Plate dimensions in millimetres.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformGeometry {
    pub lx_mm: f64,
    pub ly_mm: f64,
    /// Height of the plate surface above the load cells.
    pub h_mm: f64,
}

impl Default for PlatformGeometry {
    fn default() -> Self {
        Self {
            lx_mm: 508.0,
            ly_mm: 308.0,
            h_mm: 20.0,
        }
    }
}

/// Per-axis total force, one entry per tick. Axes without sensors are empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformForces {
    pub fx: Vec<f64>,
    pub fy: Vec<f64>,
    pub fz: Vec<f64>,
}

/// Centre of pressure relative to its own trial average (mm).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CenterOfPressure {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEllipse {
    pub center: (f64, f64),
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Orientation of the major axis (radians).
    pub angle: f64,
    pub area_cm2: f64,
    pub boundary: Vec<(f64, f64)>,
}

pub fn sum_columns(frame: &DataFrame) -> Vec<f64> {
    frame.values().sum_axis(Axis(1)).to_vec()
}

/// Computes the centre of pressure from three 4-column frames (corners 1..4).
///
/// Returns `None` when the frames are not 4 columns of equal length, or when the
/// vertical force is zero or not finite on any tick.
pub fn center_of_pressure(
    fx: &DataFrame,
    fy: &DataFrame,
    fz: &DataFrame,
    geometry: &PlatformGeometry,
) -> Option<CenterOfPressure> {
    let rows = fz.n_rows();
    if [fx, fy, fz]
        .iter()
        .any(|f| f.n_cols() != PLATFORM_CORNERS || f.n_rows() != rows)
    {
        return None;
    }
    let fx_total = fx.values().sum_axis(Axis(1));
    let fy_total = fy.values().sum_axis(Axis(1));
    let fz_total = fz.values().sum_axis(Axis(1));
    if fz_total.iter().any(|v| !v.is_finite() || *v == 0.0) {
        return None;
    }
    let z = |corner: usize| fz.values().column(corner);
    let mx = (&z(2) + &z(3) - &z(0) - &z(1)) * (geometry.ly_mm / 2.0);
    let my = (&z(1) + &z(2) - &z(0) - &z(3)) * (geometry.lx_mm / 2.0);

    let cop_x = (&fx_total * -geometry.h_mm - &my) / &fz_total;
    let cop_y = (&fy_total * -geometry.h_mm + &mx) / &fz_total;
    Some(CenterOfPressure {
        x: recenter(cop_x),
        y: recenter(cop_y),
    })
}

fn recenter(series: Array1<f64>) -> Vec<f64> {
    let mean = series.mean().unwrap_or(0.0);
    series.mapv(|v| v - mean).to_vec()
}

/// Postural-sway ellipse from the COP covariance.
///
/// Semi-axes are the square roots of the covariance eigenvalues; the area is
/// reported in cm² (input in mm).
pub fn confidence_ellipse(cop: &CenterOfPressure) -> Option<ConfidenceEllipse> {
    let n = cop.x.len();
    if n < 2 || cop.y.len() != n {
        return None;
    }
    let mean = |v: &[f64]| v.iter().sum::<f64>() / n as f64;
    let (mx, my) = (mean(&cop.x), mean(&cop.y));
    let mut cov = [0.0; 3]; // xx, xy, yy
    for (x, y) in cop.x.iter().zip(&cop.y) {
        let (dx, dy) = (x - mx, y - my);
        cov[0] += dx * dx;
        cov[1] += dx * dy;
        cov[2] += dy * dy;
    }
    let denom = (n - 1) as f64;
    let matrix = Matrix2::new(cov[0] / denom, cov[1] / denom, cov[1] / denom, cov[2] / denom);
    if matrix.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let eigen = SymmetricEigen::new(matrix);
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let semi_major = eigen.eigenvalues[major].max(0.0).sqrt();
    let semi_minor = eigen.eigenvalues[minor].max(0.0).sqrt();
    let direction = eigen.eigenvectors.column(major);
    let angle = direction[1].atan2(direction[0]);
    let (sin_a, cos_a) = angle.sin_cos();
    let boundary = (0..ELLIPSE_POINTS)
        .map(|i| {
            let t = 2.0 * PI * i as f64 / (ELLIPSE_POINTS - 1) as f64;
            let (u, v) = (semi_major * t.cos(), semi_minor * t.sin());
            (mx + u * cos_a - v * sin_a, my + u * sin_a + v * cos_a)
        })
        .collect();
    Some(ConfidenceEllipse {
        center: (mx, my),
        semi_major,
        semi_minor,
        angle,
        area_cm2: PI * semi_major * semi_minor / 100.0,
        boundary,
    })
}
