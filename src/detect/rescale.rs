//! Pixel-space to real-world coordinate rescaling.
//!
//! Rectification already removed the rotation, so the mapping is a pure
//! componentwise scale by the calibration's `(scale_x, scale_y)`. Applied
//! exactly once per cycle, after postprocessing and before the batch is
//! published.

use super::Detection;

/// Scale every geometric field of the batch in place: bbox corners, pick
/// point and keypoints.
pub fn rescale_batch(batch: &mut [Detection], scale_x: f64, scale_y: f64) {
    for det in batch.iter_mut() {
        det.bbox.x1 *= scale_x;
        det.bbox.x2 *= scale_x;
        det.bbox.y1 *= scale_y;
        det.bbox.y2 *= scale_y;
        if let Some(p) = det.pick_point.as_mut() {
            p.x *= scale_x;
            p.y *= scale_y;
        }
        if let Some(points) = det.keypoints.as_mut() {
            for p in points.iter_mut() {
                p.x *= scale_x;
                p.y *= scale_y;
            }
        }
    }
}
