//! Shared frame store and the encoded-frame codec.
//!
//! Frames travel between services as encoded image bytes under well-known
//! keys (raw camera stream vs processed stream). The transport behind the
//! store is an external concern; an in-memory implementation ships for
//! embedding and tests.

use std::collections::HashMap;

use anyhow::Result;
use image::{ImageFormat, RgbImage};
use parking_lot::RwLock;

use crate::error::PipelineError;

/// Default key the camera service publishes raw frames under.
pub const RAW_FRAME_KEY: &str = "camera_frame";
/// Default key the pipeline publishes annotated frames under.
pub const PROCESSED_FRAME_KEY: &str = "processed_frame";

/// Narrow frame-store contract: get/set of encoded image bytes by key.
pub trait FrameStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

/// In-memory frame store. Last write wins per key, which matches the
/// newest-frame semantics the pipeline expects.
#[derive(Default)]
pub struct MemoryFrameStore {
    frames: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFrameStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameStore for MemoryFrameStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.frames.read().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.frames.write().insert(key.to_string(), bytes);
        Ok(())
    }
}

/// Decode an encoded frame into RGB pixels.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::InvalidFrameGeometry(format!("frame decode failed: {e}")))
}

/// Encode a frame as JPEG for publication.
pub fn encode_frame(frame: &RgbImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(frame.clone())
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::InvalidFrameGeometry(format!("frame encode failed: {e}")))?;
    Ok(buf.into_inner())
}
