//! Planar work-surface calibration from fiducial markers.
//!
//! Four markers define the workspace: an origin, a neighbor along the X
//! axis, a neighbor along the Y axis and the far diagonal corner. From their
//! observed pixel positions the estimator derives a rigid rotation plus
//! translation and independent X/Y scale factors. This is deliberately not a
//! homography: the camera is assumed orthogonal and undistorted.

mod estimator;
mod state;

pub use estimator::{estimate, CalibrationSummary, Calibrator, MarkerLayout, MarkerRole};
pub use state::CalibrationState;
