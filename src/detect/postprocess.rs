//! Postprocessor capability table and built-in implementations.
//!
//! Each model descriptor names a postprocessor by a stable key. Keys resolve
//! against a registry populated at startup; an unresolvable key is rejected
//! when the model is activated, never mid-cycle. A postprocessor maps the
//! rectified frame plus thresholded detections to an (optionally annotated)
//! frame plus enriched detections carrying pick point and pick angle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

use crate::error::PipelineError;

use super::Detection;

pub const CENTROID_REF: &str = "centroid";
pub const CENTROID_SKIP_BACKGROUND_REF: &str = "centroid-skip-background";
pub const KEYPOINT_AXIS_REF: &str = "keypoint-axis";

/// Per-model enrichment step. Failure is non-fatal: the cycle degrades to
/// the raw detections and the unmodified frame.
pub trait Postprocessor: Send + Sync {
    fn process(
        &self,
        frame: RgbImage,
        detections: Vec<Detection>,
    ) -> Result<(RgbImage, Vec<Detection>)>;
}

/// Registered-capability table mapping postprocessor keys to
/// implementations.
pub struct PostprocessorRegistry {
    table: HashMap<String, Arc<dyn Postprocessor>>,
}

impl PostprocessorRegistry {
    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    /// A registry with the built-in postprocessors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(CENTROID_REF, Arc::new(CentroidPick { skip_class: None }));
        registry.register(
            CENTROID_SKIP_BACKGROUND_REF,
            Arc::new(CentroidPick { skip_class: Some(0) }),
        );
        registry.register(KEYPOINT_AXIS_REF, Arc::new(KeypointAxisPick));
        registry
    }

    pub fn register(&mut self, key: &str, postprocessor: Arc<dyn Postprocessor>) {
        self.table.insert(key.to_string(), postprocessor);
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Postprocessor>, PipelineError> {
        self.table
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownPostprocessor(key.to_string()))
    }
}

/// Pick at the bounding-box center with a fixed zero angle, optionally
/// dropping one class (e.g. a background class the model reports but the
/// robot must never target).
pub struct CentroidPick {
    pub skip_class: Option<u32>,
}

impl Postprocessor for CentroidPick {
    fn process(
        &self,
        frame: RgbImage,
        detections: Vec<Detection>,
    ) -> Result<(RgbImage, Vec<Detection>)> {
        let enriched = detections
            .into_iter()
            .filter(|d| Some(d.class_id) != self.skip_class)
            .map(|mut d| {
                d.pick_point = Some(d.bbox.center());
                d.pick_angle = Some(0.0);
                d
            })
            .collect();
        Ok((frame, enriched))
    }
}

/// For keypoint models: pick at the midpoint of the first two keypoints,
/// angled along their direction. Detections without two keypoints fall back
/// to the bbox center at zero angle.
pub struct KeypointAxisPick;

impl Postprocessor for KeypointAxisPick {
    fn process(
        &self,
        frame: RgbImage,
        detections: Vec<Detection>,
    ) -> Result<(RgbImage, Vec<Detection>)> {
        let enriched = detections
            .into_iter()
            .map(|mut d| {
                match d.keypoints.as_deref() {
                    Some([a, b, ..]) => {
                        d.pick_point =
                            Some(nalgebra::Point2::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0));
                        d.pick_angle = Some((b.y - a.y).atan2(b.x - a.x));
                    }
                    _ => {
                        d.pick_point = Some(d.bbox.center());
                        d.pick_angle = Some(0.0);
                    }
                }
                d
            })
            .collect();
        Ok((frame, enriched))
    }
}
