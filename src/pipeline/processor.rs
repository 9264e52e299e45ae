//! The per-frame processing loop.
//!
//! Runs on its own thread for the lifetime of the system. Each cycle fetches
//! the newest raw frame, detects markers, and then branches on calibration:
//! uncalibrated frames are annotated with the observed markers only, while
//! calibrated frames are rectified, run through the active model and its
//! postprocessor, annotated, and published together with the rescaled
//! detection batch. Every failure mode is non-fatal; the loop logs and moves
//! on to the next cycle.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::detect::{rescale_batch, ActiveModel, Detection};
use crate::error::PipelineError;
use crate::markers::{MarkerDetector, MarkerObservation};
use crate::overlay::{draw_detections, draw_markers, OverlaySettings};
use crate::rectify::rectify;
use crate::store::{decode_frame, encode_frame, FrameStore};

use super::shared_state::SharedState;

/// Wait between retries when no raw frame is available.
const FRAME_BACKOFF: Duration = Duration::from_secs(5);

pub(crate) const DELAY_KEY: &str = "Process.ProcessingDelay";
pub(crate) const DEFAULT_DELAY_SECS: f64 = 1.0;

pub(crate) struct CycleProcessor {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) config: Arc<ConfigStore>,
    pub(crate) store: Arc<dyn FrameStore>,
    pub(crate) marker_detector: Arc<dyn MarkerDetector>,
    pub(crate) overlay: OverlaySettings,
    pub(crate) raw_key: String,
    pub(crate) processed_key: String,
}

impl CycleProcessor {
    /// Run until a stop signal arrives or shutdown is requested. The stop
    /// channel doubles as the sleep timer, so shutdown interrupts both the
    /// inter-cycle delay and the no-frame backoff.
    pub(crate) fn run(self, stop_rx: Receiver<()>) {
        info!(raw_key = %self.raw_key, "processing loop started");
        self.shared.set_running(true);

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            let bytes = match self.store.get(&self.raw_key) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    warn!(key = %self.raw_key, "no raw frame available, backing off");
                    if wait(&stop_rx, FRAME_BACKOFF) {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "frame store unreachable, backing off");
                    if wait(&stop_rx, FRAME_BACKOFF) {
                        break;
                    }
                    continue;
                }
            };

            self.run_cycle(&bytes);

            if wait(&stop_rx, self.processing_delay()) {
                break;
            }
        }

        self.shared.set_running(false);
        info!("processing loop stopped");
    }

    /// Inter-cycle delay, re-read every cycle so edits apply immediately.
    fn processing_delay(&self) -> Duration {
        let secs = self.config.get_or(DELAY_KEY, DEFAULT_DELAY_SECS);
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs_f64(DEFAULT_DELAY_SECS)
        }
    }

    fn run_cycle(&self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "skipping cycle");
                return;
            }
        };

        let gray = image::imageops::grayscale(&frame);
        let markers = match self.marker_detector.detect(&gray) {
            Ok(markers) => markers,
            Err(e) => {
                warn!(error = %e, "marker detection failed, treating as none observed");
                HashMap::new()
            }
        };

        let cal = self.shared.calibration.lock().clone();
        if cal.calibrated {
            self.calibrated_cycle(frame, &cal);
        } else {
            self.uncalibrated_cycle(frame, &markers);
        }
    }

    fn uncalibrated_cycle(
        &self,
        mut frame: RgbImage,
        markers: &HashMap<u32, MarkerObservation>,
    ) {
        if !markers.is_empty() {
            debug!(count = markers.len(), "markers observed");
        }
        draw_markers(&mut frame, markers, &self.overlay);
        self.shared.clear_detections();
        self.publish_frame(&frame);
    }

    fn calibrated_cycle(&self, frame: RgbImage, cal: &crate::calibration::CalibrationState) {
        let rect = match rectify(&frame, cal) {
            Ok(rect) => rect,
            Err(e) => {
                warn!(error = %e, "rectification failed, skipping cycle");
                return;
            }
        };

        // Take a handle to the active model under the lock, infer outside it.
        let active = {
            let registry = self.shared.registry.lock();
            registry.active().map(|active| {
                let threshold = registry
                    .threshold(&active.descriptor.name)
                    .unwrap_or(active.descriptor.confidence_threshold);
                (active, threshold)
            })
        };
        let Some((active, threshold)) = active else {
            debug!("no active model, publishing rectified frame only");
            self.shared.clear_detections();
            self.publish_frame(&rect);
            return;
        };

        let raws = match active.model.infer(&rect) {
            Ok(raws) => raws,
            Err(e) => {
                error!(
                    model = %active.descriptor.name,
                    error = %e,
                    "inference failed, keeping previous batch"
                );
                return;
            }
        };

        let batch: Vec<Detection> = raws
            .into_iter()
            .filter(|raw| raw.confidence >= threshold)
            .map(|raw| Detection::from_raw(&active.descriptor.name, raw))
            .collect();

        let (mut out_frame, mut batch) = self.postprocess(&active, rect, batch);

        draw_detections(&mut out_frame, &batch, &self.overlay);
        rescale_batch(&mut batch, cal.scale_x, cal.scale_y);
        sort_for_picking(&mut batch);

        self.publish_frame(&out_frame);
        self.shared.publish_detections(batch);
    }

    /// Apply the active model's postprocessor. A fault degrades the cycle to
    /// the unprocessed detections over the rectified frame; an empty batch
    /// skips postprocessing entirely.
    fn postprocess(
        &self,
        active: &ActiveModel,
        rect: RgbImage,
        batch: Vec<Detection>,
    ) -> (RgbImage, Vec<Detection>) {
        if batch.is_empty() {
            return (rect, batch);
        }
        match active.postprocessor.process(rect.clone(), batch.clone()) {
            Ok((frame, processed)) => (frame, processed),
            Err(e) => {
                let fault = PipelineError::PostprocessorFault(e.to_string());
                warn!(
                    model = %active.descriptor.name,
                    error = %fault,
                    "degrading to unprocessed detections"
                );
                (rect, batch)
            }
        }
    }

    fn publish_frame(&self, frame: &RgbImage) {
        let encoded = match encode_frame(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "frame encode failed, skipping publication");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.processed_key, encoded) {
            warn!(error = %e, "processed frame publication failed");
        }
    }
}

/// Descending confidence, ties broken by the leftmost box. Keeps
/// `first_detection` deterministic for pick consumers.
fn sort_for_picking(batch: &mut [Detection]) {
    batch.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.bbox.x1.partial_cmp(&b.bbox.x1).unwrap_or(Ordering::Equal))
    });
}

/// True when the loop should stop: explicit signal or a dropped sender.
fn wait(stop_rx: &Receiver<()>, period: Duration) -> bool {
    match stop_rx.recv_timeout(period) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}
