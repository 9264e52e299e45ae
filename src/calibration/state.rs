//! Calibration state: the committed result of a successful calibration.

use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};

/// Tolerance for the scalar-fields/matrix consistency check.
const CONSISTENCY_EPS: f64 = 1e-9;

/// The planar calibration of the work surface.
///
/// Invariant: when `calibrated` is true, `transform` equals
/// `diag(scale_x, scale_y, 1) · RT` where `RT` is the rigid transform derived
/// from `origin` and `theta`. The whole struct is swapped atomically under a
/// lock, so readers never observe the scalars and the matrix disagreeing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CalibrationState {
    pub calibrated: bool,
    /// Pixel position of the origin marker corner in the raw frame.
    pub origin: Point2<f64>,
    /// Rotation of the workspace X axis relative to the image axes, radians.
    pub theta: f64,
    /// Pixel extents (width, height) of the rectified crop.
    pub size: (u32, u32),
    pub scale_x: f64,
    pub scale_y: f64,
    /// Raw-pixel to real-world-unit transform, homogeneous 3x3.
    #[serde(rename = "RST")]
    pub transform: Matrix3<f64>,
}

impl CalibrationState {
    /// The cleared state a fresh process starts from and `uncalibrate()`
    /// returns to.
    pub fn uncalibrated() -> Self {
        Self {
            calibrated: false,
            origin: Point2::origin(),
            theta: 0.0,
            size: (0, 0),
            scale_x: 1.0,
            scale_y: 1.0,
            transform: Matrix3::identity(),
        }
    }

    /// Rigid part of the calibration: maps raw pixel coordinates into the
    /// rectified frame (origin at the origin marker, X axis along the
    /// origin-to-x-axis marker direction).
    pub fn rigid_transform(&self) -> Matrix3<f64> {
        let (s, c) = self.theta.sin_cos();
        let (ox, oy) = (self.origin.x, self.origin.y);
        Matrix3::new(
            c, s, -(c * ox + s * oy),
            -s, c, s * ox - c * oy,
            0.0, 0.0, 1.0,
        )
    }

    /// Scale part: rectified pixels to real-world units.
    pub fn scale_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.scale_x, 0.0, 0.0,
            0.0, self.scale_y, 0.0,
            0.0, 0.0, 1.0,
        )
    }

    /// Whether `transform` agrees with the scalar fields. Always true for an
    /// uncalibrated state.
    pub fn is_consistent(&self) -> bool {
        if !self.calibrated {
            return true;
        }
        let expected = self.scale_matrix() * self.rigid_transform();
        (self.transform - expected).abs().max() < CONSISTENCY_EPS
    }
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self::uncalibrated()
    }
}
