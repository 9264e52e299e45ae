//! Annotation overlays for operator feedback.
//!
//! Draws observed markers on uncalibrated frames and detection geometry
//! (boxes, pick points, keypoints) on calibrated frames before publication.
//! Which elements are drawn is configurable through the `Display` config
//! section.

use std::collections::HashMap;

use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_cross_mut, draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::detect::Detection;
use crate::markers::MarkerObservation;

const MARKER_OUTLINE: Rgb<u8> = Rgb([0, 255, 0]);
const MARKER_CENTER: Rgb<u8> = Rgb([255, 0, 0]);

/// Per-class color palette, cycled by class id.
const PALETTE: [Rgb<u8>; 7] = [
    Rgb([0, 255, 0]),
    Rgb([255, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([0, 255, 255]),
    Rgb([255, 165, 0]),
    Rgb([255, 0, 255]),
    Rgb([255, 0, 0]),
];

/// Overlay element toggles, stored under the `Display` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    #[serde(rename = "BBOX")]
    pub bbox: bool,
    #[serde(rename = "POINTS")]
    pub pick_points: bool,
    #[serde(rename = "KEYPOINTS")]
    pub keypoints: bool,
    #[serde(rename = "MARKERS")]
    pub markers: bool,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self { bbox: true, pick_points: true, keypoints: true, markers: true }
    }
}

impl OverlaySettings {
    pub fn from_config(config: &ConfigStore) -> Self {
        config.get_or("Display", Self::default())
    }
}

/// Outline each observed marker and cross its center.
pub fn draw_markers(
    frame: &mut RgbImage,
    markers: &HashMap<u32, MarkerObservation>,
    settings: &OverlaySettings,
) {
    if !settings.markers {
        return;
    }
    for marker in markers.values() {
        for i in 0..4 {
            let a = marker.corners[i];
            let b = marker.corners[(i + 1) % 4];
            draw_line_segment_mut(
                frame,
                (a.x as f32, a.y as f32),
                (b.x as f32, b.y as f32),
                MARKER_OUTLINE,
            );
        }
        draw_cross_mut(
            frame,
            MARKER_CENTER,
            marker.center.x as i32,
            marker.center.y as i32,
        );
    }
}

/// Draw detection geometry in rectified-frame pixel coordinates. Called
/// before rescaling, so everything still lines up with the frame.
pub fn draw_detections(frame: &mut RgbImage, batch: &[Detection], settings: &OverlaySettings) {
    for det in batch {
        let color = PALETTE[det.class_id as usize % PALETTE.len()];

        if settings.bbox {
            let w = ((det.bbox.x2 - det.bbox.x1).round() as i64).max(1) as u32;
            let h = ((det.bbox.y2 - det.bbox.y1).round() as i64).max(1) as u32;
            let rect = Rect::at(det.bbox.x1 as i32, det.bbox.y1 as i32).of_size(w, h);
            draw_hollow_rect_mut(frame, rect, color);
        }

        if settings.pick_points {
            if let Some(p) = det.pick_point {
                draw_filled_circle_mut(frame, (p.x as i32, p.y as i32), 5, color);
            }
        }

        if settings.keypoints {
            if let Some(points) = det.keypoints.as_deref() {
                for (i, p) in points.iter().enumerate() {
                    let color = PALETTE[(i + 2) % PALETTE.len()];
                    draw_filled_circle_mut(frame, (p.x as i32, p.y as i32), 5, color);
                }
            }
        }
    }
}
