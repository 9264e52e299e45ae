//! Detection data model and the model/postprocessor plugin protocol.

mod postprocess;
mod registry;
mod rescale;

pub use postprocess::{
    CentroidPick, KeypointAxisPick, Postprocessor, PostprocessorRegistry,
    CENTROID_REF, CENTROID_SKIP_BACKGROUND_REF, KEYPOINT_AXIS_REF,
};
pub use registry::{ActiveModel, DetectionModel, ModelDescriptor, ModelLoader, ModelRegistry};
pub use rescale::rescale_batch;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// What a model produces: plain boxes, or boxes plus keypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "detect")]
    Detect,
    #[serde(rename = "detect+keypoints")]
    DetectWithKeypoints,
}

/// Axis-aligned box, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn center(&self) -> Point2<f64> {
        Point2::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// What the inference engine reports before the pipeline enriches it.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub class_id: u32,
    pub class_name: String,
    pub keypoints: Option<Vec<Point2<f64>>>,
}

/// One detected object as exposed to external consumers. Pick point and
/// angle are filled in by the model's postprocessor; coordinates are in
/// real-world units once the batch has been rescaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub model_name: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub class_id: u32,
    pub class_name: String,
    pub keypoints: Option<Vec<Point2<f64>>>,
    pub pick_point: Option<Point2<f64>>,
    pub pick_angle: Option<f64>,
}

impl Detection {
    pub fn from_raw(model_name: &str, raw: RawDetection) -> Self {
        Self {
            model_name: model_name.to_string(),
            bbox: raw.bbox,
            confidence: raw.confidence,
            class_id: raw.class_id,
            class_name: raw.class_name,
            keypoints: raw.keypoints,
            pick_point: None,
            pick_angle: None,
        }
    }
}
