//! Shared state between the processing loop and command callers.
//!
//! The loop reads the calibration and active model every cycle; command
//! operations write them. Both sides go through the locks here, so a cycle
//! observes either the pre- or post-update state in full, never a partial
//! one. The detection batch is written once per cycle by the loop (full
//! replacement) and read by any number of concurrent callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::calibration::CalibrationState;
use crate::detect::{Detection, ModelRegistry};

pub struct SharedState {
    /// Planar work-surface calibration. Swapped wholesale under the lock.
    pub calibration: Mutex<CalibrationState>,

    /// Model descriptors plus the active model reference.
    pub registry: Mutex<ModelRegistry>,

    /// Most recent published detection batch, real-world coordinates.
    detections: RwLock<Vec<Detection>>,

    /// True while the loop thread is inside its run loop.
    running: AtomicBool,

    /// Request the loop to exit at the next cycle boundary.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(calibration: CalibrationState, registry: ModelRegistry) -> Arc<Self> {
        Arc::new(Self {
            calibration: Mutex::new(calibration),
            registry: Mutex::new(registry),
            detections: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Replace the exposed batch. The caller finishes rescaling first, so
    /// readers only ever see complete real-world batches.
    pub fn publish_detections(&self, batch: Vec<Detection>) {
        *self.detections.write() = batch;
    }

    pub fn clear_detections(&self) {
        self.detections.write().clear();
    }

    pub fn latest_detections(&self) -> Vec<Detection> {
        self.detections.read().clone()
    }

    /// First detection of the published batch. The loop publishes sorted by
    /// descending confidence with leftmost-first tie-breaking, so this is
    /// deterministic.
    pub fn first_detection(&self) -> Option<Detection> {
        self.detections.read().first().cloned()
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
