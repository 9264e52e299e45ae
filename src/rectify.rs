//! Calibrated frame rectification.
//!
//! Applies the rigid part of the calibration to a raw frame: rotates about
//! the calibration origin by `-theta` so the workspace X axis becomes
//! horizontal, then crops the axis-aligned `[origin, origin + size]` window.
//! Both steps are fused into one inverse-mapped bilinear resample: output
//! pixel `(u, v)` samples the raw frame at `origin + R(theta) · (u, v)`.
//!
//! This is a rigid approximation, not a perspective unwarp. The calibration
//! assumes an orthogonal, undistorted view; residual perspective error is a
//! documented limitation.

use image::{Rgb, RgbImage};

use crate::calibration::CalibrationState;
use crate::error::PipelineError;

/// Rectify a raw frame with a committed calibration.
///
/// Errors with `InvalidFrameGeometry` when the calibration is absent, the
/// crop is zero-sized, or the frame itself is empty. Pixels the crop reaches
/// outside the raw frame are filled black.
pub fn rectify(frame: &RgbImage, cal: &CalibrationState) -> Result<RgbImage, PipelineError> {
    if !cal.calibrated {
        return Err(PipelineError::InvalidFrameGeometry(
            "rectification requires a committed calibration".to_string(),
        ));
    }
    let (width, height) = cal.size;
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidFrameGeometry(
            "zero-sized rectified crop".to_string(),
        ));
    }
    if frame.width() == 0 || frame.height() == 0 {
        return Err(PipelineError::InvalidFrameGeometry("empty raw frame".to_string()));
    }

    let (sin_t, cos_t) = cal.theta.sin_cos();
    let mut out = RgbImage::new(width, height);
    for (u, v, px) in out.enumerate_pixels_mut() {
        let (uf, vf) = (u as f64, v as f64);
        let x = cal.origin.x + uf * cos_t - vf * sin_t;
        let y = cal.origin.y + uf * sin_t + vf * cos_t;
        *px = sample_bilinear(frame, x, y);
    }
    Ok(out)
}

fn sample_bilinear(frame: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = frame.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = frame.get_pixel(x0, y0);
    let p10 = frame.get_pixel(x1, y0);
    let p01 = frame.get_pixel(x0, y1);
    let p11 = frame.get_pixel(x1, y1);

    let mut blended = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        blended[c] = (top * (1.0 - fy) + bottom * fy).round() as u8;
    }
    Rgb(blended)
}
