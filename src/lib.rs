//! Marker-calibrated detection pipeline for a vision-guided pick cell.
//!
//! The crate turns a raw camera stream into a stream of annotated frames and
//! real-world-coordinate detections. Four fiducial markers on the work
//! surface anchor a planar calibration; calibrated frames are rectified, run
//! through a swappable detection model, refined by the model's postprocessor,
//! and published. Camera, marker detector, inference engine, and frame
//! transport are external collaborators behind narrow traits.

pub mod calibration;
pub mod config;
pub mod detect;
pub mod error;
pub mod markers;
pub mod overlay;
pub mod pipeline;
pub mod rectify;
pub mod store;
