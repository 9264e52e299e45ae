//! System lifecycle and the synchronized command surface.
//!
//! `VisionSystem::start` wires the collaborators together, restores persisted
//! state (calibration, model registry, last active model), and spawns the
//! processing loop on its own thread. Commands run on the caller's thread and
//! synchronize with the loop through the shared state; the long-running ones
//! (calibrate, model activation) additionally serialize against themselves
//! through named command locks.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Sender};
use tracing::{info, warn};

use crate::calibration::{CalibrationSummary, Calibrator};
use crate::config::ConfigStore;
use crate::detect::{
    ActiveModel, Detection, ModelDescriptor, ModelLoader, ModelRegistry, PostprocessorRegistry,
};
use crate::error::PipelineError;
use crate::markers::MarkerDetector;
use crate::overlay::OverlaySettings;
use crate::store::{decode_frame, FrameStore, PROCESSED_FRAME_KEY, RAW_FRAME_KEY};

use super::locks::CommandLocks;
use super::processor::{CycleProcessor, DELAY_KEY};
use super::shared_state::SharedState;

const LAST_MODEL_KEY: &str = "Process.LastModel";
const RAW_KEY_KEY: &str = "Process.RawFrameKey";
const PROCESSED_KEY_KEY: &str = "Process.ProcessedFrameKey";

const CALIBRATE_LOCK: &str = "calibrate";
const ACTIVATE_LOCK: &str = "activate";

pub struct VisionSystem {
    shared: Arc<SharedState>,
    config: Arc<ConfigStore>,
    store: Arc<dyn FrameStore>,
    marker_detector: Arc<dyn MarkerDetector>,
    loader: Arc<dyn ModelLoader>,
    postprocessors: Arc<PostprocessorRegistry>,
    calibrator: Calibrator,
    locks: CommandLocks,
    raw_key: String,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl VisionSystem {
    /// Restore persisted state, reactivate the last model on a best-effort
    /// basis, and spawn the processing loop.
    pub fn start(
        config: Arc<ConfigStore>,
        store: Arc<dyn FrameStore>,
        marker_detector: Arc<dyn MarkerDetector>,
        loader: Arc<dyn ModelLoader>,
        postprocessors: PostprocessorRegistry,
        models_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let calibrator = Calibrator::new(config.clone());
        let registry = ModelRegistry::from_config(config.clone(), models_dir);
        let shared = SharedState::new(calibrator.load_state(), registry);

        let raw_key = config.get_or(RAW_KEY_KEY, RAW_FRAME_KEY.to_string());
        let processed_key = config.get_or(PROCESSED_KEY_KEY, PROCESSED_FRAME_KEY.to_string());

        let (stop_tx, stop_rx) = bounded(1);
        let mut system = Self {
            shared: shared.clone(),
            config: config.clone(),
            store: store.clone(),
            marker_detector: marker_detector.clone(),
            loader,
            postprocessors: Arc::new(postprocessors),
            calibrator,
            locks: CommandLocks::new(),
            raw_key: raw_key.clone(),
            stop_tx,
            worker: None,
        };

        // Restore the last active model before the first cycle runs. Startup
        // survives a stale reference; the system simply starts with no model.
        if let Some(name) = config.get_or::<Option<String>>(LAST_MODEL_KEY, None) {
            if let Err(e) = system.activate(&name) {
                warn!(model = %name, error = %e, "could not reactivate last model");
            }
        }

        let processor = CycleProcessor {
            shared,
            config: config.clone(),
            store,
            marker_detector,
            overlay: OverlaySettings::from_config(&config),
            raw_key,
            processed_key,
        };
        system.worker = Some(
            std::thread::Builder::new()
                .name("vision-cycle".to_string())
                .spawn(move || processor.run(stop_rx))
                .context("spawning the processing loop thread")?,
        );

        info!("vision system started");
        Ok(system)
    }

    /// Calibrate from the current raw frame. Serialized against concurrent
    /// calibrate calls; the processing loop keeps running and picks up the
    /// new calibration on its next cycle.
    pub fn calibrate(&self) -> Result<CalibrationSummary, PipelineError> {
        let _guard = self.locks.acquire(CALIBRATE_LOCK);

        let bytes = self
            .store
            .get(&self.raw_key)
            .map_err(|e| PipelineError::CollaboratorUnavailable(e.to_string()))?
            .ok_or_else(|| {
                PipelineError::CollaboratorUnavailable("no raw frame to calibrate from".to_string())
            })?;
        let frame = decode_frame(&bytes)?;
        let gray = image::imageops::grayscale(&frame);
        let markers = self
            .marker_detector
            .detect(&gray)
            .map_err(|e| PipelineError::CollaboratorUnavailable(e.to_string()))?;

        self.calibrator.calibrate(&self.shared.calibration, &markers)
    }

    /// Clear the calibration. Idempotent.
    pub fn uncalibrate(&self) -> Result<(), PipelineError> {
        let _guard = self.locks.acquire(CALIBRATE_LOCK);
        self.calibrator.uncalibrate(&self.shared.calibration)
    }

    /// All registered model descriptors, sorted by name.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.shared.registry.lock().models()
    }

    /// Descriptor of the currently active model, if any.
    pub fn active_model(&self) -> Option<ModelDescriptor> {
        self.shared.registry.lock().active_descriptor().cloned()
    }

    /// Register (or overwrite) a model descriptor. Does not activate it.
    /// The config write to disk happens after the registry lock is released.
    pub fn add_model(&self, descriptor: ModelDescriptor) -> Result<(), PipelineError> {
        self.shared.registry.lock().insert(descriptor)?;
        self.config.save()?;
        Ok(())
    }

    /// Update a model's confidence threshold; applies from the next cycle.
    pub fn set_threshold(&self, name: &str, value: f64) -> Result<(), PipelineError> {
        self.shared.registry.lock().set_threshold(name, value)?;
        self.config.save()?;
        Ok(())
    }

    /// Activate a registered model. The previous model keeps serving until
    /// the new model and its postprocessor are loaded as a pair; only then is
    /// the active reference swapped.
    pub fn change_model(&self, name: &str) -> Result<(), PipelineError> {
        let _guard = self.locks.acquire(ACTIVATE_LOCK);
        self.activate(name)
    }

    fn activate(&self, name: &str) -> Result<(), PipelineError> {
        let (descriptor, weights) = {
            let registry = self.shared.registry.lock();
            let descriptor = registry.descriptor(name)?.clone();
            let weights = registry.weights_path(&descriptor);
            (descriptor, weights)
        };
        if !weights.is_file() {
            return Err(PipelineError::MissingWeights(weights));
        }
        let postprocessor = self.postprocessors.resolve(&descriptor.postprocessor_ref)?;

        // Model loading can be slow; it happens outside every lock.
        let model = self
            .loader
            .load(&weights, descriptor.kind)
            .map_err(|e| PipelineError::CollaboratorUnavailable(format!("loading `{name}`: {e}")))?;

        self.shared
            .registry
            .lock()
            .set_active(ActiveModel { descriptor, model, postprocessor });

        self.config.set(LAST_MODEL_KEY, name)?;
        self.config.save()?;
        Ok(())
    }

    /// Set the inter-cycle delay in seconds; takes effect on the next cycle.
    pub fn set_processing_delay(&self, secs: f64) -> Result<(), PipelineError> {
        if !(secs.is_finite() && secs > 0.0) {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "processing delay {secs} must be a positive number of seconds"
            )));
        }
        self.config.set(DELAY_KEY, secs)?;
        self.config.save()?;
        Ok(())
    }

    /// Snapshot of the most recently published detection batch.
    pub fn latest_detections(&self) -> Vec<Detection> {
        self.shared.latest_detections()
    }

    /// Highest-confidence detection of the latest batch, leftmost on ties.
    pub fn first_detection(&self) -> Option<Detection> {
        self.shared.first_detection()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Stop the processing loop and join its thread. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("processing loop thread panicked");
            }
        }
    }
}

impl Drop for VisionSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{MarkerLayout, MarkerRole};
    use crate::detect::{
        BoundingBox, DetectionModel, ModelKind, RawDetection, CENTROID_REF,
    };
    use crate::markers::MarkerObservation;
    use crate::store::{encode_frame, MemoryFrameStore};
    use image::{GrayImage, Rgb, RgbImage};
    use nalgebra::Point2;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::{Duration, Instant};

    /// Four square markers forming a 400x300 rectangle with top-left corners
    /// at (100,100), (500,100), (500,400), (100,400).
    struct SquareMarkers;
    impl MarkerDetector for SquareMarkers {
        fn detect(&self, _gray: &GrayImage) -> Result<HashMap<u32, MarkerObservation>> {
            let square = |id: u32, x: f64, y: f64| {
                MarkerObservation::new(
                    id,
                    [
                        Point2::new(x, y),
                        Point2::new(x + 10.0, y),
                        Point2::new(x + 10.0, y + 10.0),
                        Point2::new(x, y + 10.0),
                    ],
                )
            };
            Ok([
                (0, square(0, 100.0, 100.0)),
                (1, square(1, 500.0, 100.0)),
                (2, square(2, 500.0, 400.0)),
                (3, square(3, 100.0, 400.0)),
            ]
            .into_iter()
            .collect())
        }
    }

    struct StubModel;
    impl DetectionModel for StubModel {
        fn infer(&self, _frame: &RgbImage) -> Result<Vec<RawDetection>> {
            Ok(vec![
                RawDetection {
                    bbox: BoundingBox { x1: 10.0, y1: 10.0, x2: 30.0, y2: 50.0 },
                    confidence: 0.9,
                    class_id: 1,
                    class_name: "part".to_string(),
                    keypoints: None,
                },
                RawDetection {
                    bbox: BoundingBox { x1: 60.0, y1: 60.0, x2: 70.0, y2: 70.0 },
                    confidence: 0.1,
                    class_id: 1,
                    class_name: "part".to_string(),
                    keypoints: None,
                },
            ])
        }
    }

    struct StubLoader;
    impl ModelLoader for StubLoader {
        fn load(&self, _weights: &Path, _kind: ModelKind) -> Result<Arc<dyn DetectionModel>> {
            Ok(Arc::new(StubModel))
        }
    }

    fn layout() -> MarkerLayout {
        MarkerLayout {
            origin: MarkerRole { id: 0, corner: 0 },
            x_axis: MarkerRole { id: 1, corner: 0 },
            diagonal: MarkerRole { id: 2, corner: 0 },
            y_axis: MarkerRole { id: 3, corner: 0 },
            // 2.0 units per pixel in X, 0.5 in Y.
            x_distance: 800.0,
            y_distance: 150.0,
        }
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor {
            name: "Stub".to_string(),
            weights_file: "stub.pt".to_string(),
            confidence_threshold: 0.5,
            kind: ModelKind::Detect,
            postprocessor_ref: CENTROID_REF.to_string(),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn start_system(
        dir: &Path,
        store: Arc<MemoryFrameStore>,
    ) -> (Arc<ConfigStore>, VisionSystem) {
        let config = Arc::new(ConfigStore::open(dir.join("config.json")).unwrap());
        config.set("Markers", layout()).unwrap();
        config.set("Models.Stub", descriptor()).unwrap();
        config.set("Process.ProcessingDelay", 0.02).unwrap();

        let system = VisionSystem::start(
            config.clone(),
            store,
            Arc::new(SquareMarkers),
            Arc::new(StubLoader),
            PostprocessorRegistry::with_builtins(),
            dir,
        )
        .unwrap();
        (config, system)
    }

    #[test]
    fn full_cycle_from_calibration_to_first_detection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();

        let store = Arc::new(MemoryFrameStore::new());
        let frame = RgbImage::from_pixel(600, 500, Rgb([120, 120, 120]));
        store.set(RAW_FRAME_KEY, encode_frame(&frame).unwrap()).unwrap();

        let (_config, mut system) = start_system(dir.path(), store.clone());
        wait_for(|| system.is_running());

        system.change_model("Stub").unwrap();
        assert_eq!(system.active_model().unwrap().name, "Stub");

        let summary = system.calibrate().unwrap();
        assert_eq!(summary.size, (400, 300));
        assert_eq!(summary.scale_x, 2.0);
        assert_eq!(summary.scale_y, 0.5);

        wait_for(|| !system.latest_detections().is_empty());

        let batch = system.latest_detections();
        assert_eq!(batch.len(), 1, "the 0.1-confidence detection is filtered");
        assert_eq!(batch[0].model_name, "Stub");
        // Bbox center (20, 30) rescaled by (2.0, 0.5).
        assert_eq!(batch[0].pick_point, Some(Point2::new(40.0, 15.0)));
        assert!(system.first_detection().is_some());
        assert!(store.get(PROCESSED_FRAME_KEY).unwrap().is_some());

        system.uncalibrate().unwrap();
        wait_for(|| system.latest_detections().is_empty());

        system.shutdown();
        assert!(!system.is_running());
    }

    #[test]
    fn last_model_is_reactivated_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();
        let store = Arc::new(MemoryFrameStore::new());

        {
            let (_config, system) = start_system(dir.path(), store.clone());
            system.change_model("Stub").unwrap();
        }

        // A fresh system over the same config picks the model back up.
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        let system = VisionSystem::start(
            config,
            store,
            Arc::new(SquareMarkers),
            Arc::new(StubLoader),
            PostprocessorRegistry::with_builtins(),
            dir.path(),
        )
        .unwrap();
        assert_eq!(system.active_model().unwrap().name, "Stub");
    }

    #[test]
    fn failed_activation_keeps_the_previous_model() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();
        let store = Arc::new(MemoryFrameStore::new());

        let (_config, system) = start_system(dir.path(), store);
        system.change_model("Stub").unwrap();

        assert!(matches!(
            system.change_model("Nope"),
            Err(PipelineError::UnknownModel(_))
        ));
        assert_eq!(system.active_model().unwrap().name, "Stub");

        let mut bad = descriptor();
        bad.name = "Ghost".to_string();
        bad.weights_file = "ghost.pt".to_string();
        system.add_model(bad).unwrap();
        assert!(matches!(
            system.change_model("Ghost"),
            Err(PipelineError::MissingWeights(_))
        ));
        assert_eq!(system.active_model().unwrap().name, "Stub");
    }

    #[test]
    fn add_model_and_set_threshold_reach_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();
        let store = Arc::new(MemoryFrameStore::new());

        let (_config, system) = start_system(dir.path(), store);
        let mut extra = descriptor();
        extra.name = "Extra".to_string();
        system.add_model(extra).unwrap();
        system.set_threshold("Extra", 0.7).unwrap();

        // A fresh store over the same file sees both mutations.
        let reloaded = ConfigStore::open(dir.path().join("config.json")).unwrap();
        assert_eq!(
            reloaded.get_or("Models.Extra.ConfidenceThreshold", 0.0),
            0.7
        );
        assert_eq!(
            reloaded.get_or("Models.Extra.ModelFileName", String::new()),
            "stub.pt"
        );
    }

    #[test]
    fn calibrate_without_a_frame_reports_the_collaborator() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();
        let store = Arc::new(MemoryFrameStore::new());

        let (_config, system) = start_system(dir.path(), store);
        assert!(matches!(
            system.calibrate(),
            Err(PipelineError::CollaboratorUnavailable(_))
        ));
    }

    #[test]
    fn processing_delay_is_validated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stub.pt"), b"weights").unwrap();
        let store = Arc::new(MemoryFrameStore::new());

        let (config, system) = start_system(dir.path(), store);
        assert!(system.set_processing_delay(0.0).is_err());
        assert!(system.set_processing_delay(f64::NAN).is_err());

        system.set_processing_delay(0.25).unwrap();
        assert_eq!(config.get_or("Process.ProcessingDelay", 1.0), 0.25);
    }
}
