//! Fiducial marker observations and the marker-detector capability.
//!
//! The actual detector (ArUco or similar) is an external collaborator; the
//! pipeline only depends on the observation shape it produces each cycle.

use std::collections::HashMap;

use anyhow::Result;
use image::GrayImage;
use nalgebra::Point2;

/// One detected fiducial marker. Ephemeral: produced fresh each cycle and
/// never persisted.
#[derive(Debug, Clone)]
pub struct MarkerObservation {
    pub id: u32,
    /// Ordered corners: top-left, top-right, bottom-right, bottom-left.
    pub corners: [Point2<f64>; 4],
    pub center: Point2<f64>,
}

impl MarkerObservation {
    /// Build an observation from its four ordered corners. The center is the
    /// midpoint of the top-left/bottom-right diagonal.
    pub fn new(id: u32, corners: [Point2<f64>; 4]) -> Self {
        let center = Point2::new(
            (corners[0].x + corners[2].x) / 2.0,
            (corners[0].y + corners[2].y) / 2.0,
        );
        Self { id, corners, center }
    }

    pub fn corner(&self, index: usize) -> Option<Point2<f64>> {
        self.corners.get(index).copied()
    }
}

/// External marker-detector capability. Runs on the grayscale frame every
/// cycle regardless of calibration state.
pub trait MarkerDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage) -> Result<HashMap<u32, MarkerObservation>>;
}
