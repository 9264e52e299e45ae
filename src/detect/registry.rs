//! Model registry: named detection-model descriptors and the active model.
//!
//! The registry is loaded from configuration at startup and pruned of
//! entries whose weights files are missing on disk. Mutations stage their
//! changes in the config document; callers write the document to disk after
//! releasing the registry lock, keeping file I/O out of the critical section
//! the processing loop takes every cycle.
//! Activation follows a load-then-swap protocol: the new model and its
//! postprocessor are loaded as a matched pair before the active reference
//! changes, so the previous model keeps serving until the swap and there is
//! no window with no active model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::error::PipelineError;

use super::postprocess::Postprocessor;
use super::{ModelKind, RawDetection};

/// Config section holding the model descriptors.
const MODELS_SECTION: &str = "Models";

/// External inference capability for one loaded model.
pub trait DetectionModel: Send + Sync {
    fn infer(&self, frame: &RgbImage) -> Result<Vec<RawDetection>>;
}

/// Loads the inference capability from a weights file. The implementation
/// decides the device target; the registry only cares about the contract.
pub trait ModelLoader: Send + Sync {
    fn load(&self, weights: &Path, kind: ModelKind) -> Result<Arc<dyn DetectionModel>>;
}

/// Persistent description of one model. Field names mirror the stored
/// configuration keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(rename = "ModelName")]
    pub name: String,
    #[serde(rename = "ModelFileName")]
    pub weights_file: String,
    #[serde(rename = "ConfidenceThreshold")]
    pub confidence_threshold: f64,
    #[serde(rename = "ModelType")]
    pub kind: ModelKind,
    #[serde(rename = "ModelProcessor")]
    pub postprocessor_ref: String,
}

/// The currently serving model: descriptor plus the loaded inference and
/// postprocessor capabilities as a matched pair. Cheap to clone, so the loop
/// takes a handle under the lock and runs inference outside it.
#[derive(Clone)]
pub struct ActiveModel {
    pub descriptor: ModelDescriptor,
    pub model: Arc<dyn DetectionModel>,
    pub postprocessor: Arc<dyn Postprocessor>,
}

pub struct ModelRegistry {
    config: Arc<ConfigStore>,
    models_dir: PathBuf,
    models: HashMap<String, ModelDescriptor>,
    active: Option<ActiveModel>,
}

impl ModelRegistry {
    /// Load descriptors from the `Models` config section, dropping entries
    /// whose weights files are missing on disk.
    pub fn from_config(config: Arc<ConfigStore>, models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        let stored: HashMap<String, ModelDescriptor> =
            config.get_or(MODELS_SECTION, HashMap::new());

        let mut models = HashMap::new();
        for (name, descriptor) in stored {
            let weights = models_dir.join(&descriptor.weights_file);
            if weights.is_file() {
                models.insert(name, descriptor);
            } else {
                error!(
                    model = %name,
                    weights = %weights.display(),
                    "weights file missing, dropping model from registry"
                );
            }
        }
        info!(count = models.len(), "model registry loaded");

        Self { config, models_dir, models, active: None }
    }

    pub fn descriptor(&self, name: &str) -> Result<&ModelDescriptor, PipelineError> {
        self.models
            .get(name)
            .ok_or_else(|| PipelineError::UnknownModel(name.to_string()))
    }

    /// All known descriptors, for the command surface.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        let mut list: Vec<_> = self.models.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn weights_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&descriptor.weights_file)
    }

    /// Insert or overwrite a descriptor by name, staging it in the config
    /// document. The active model is unaffected.
    pub fn insert(&mut self, descriptor: ModelDescriptor) -> Result<(), PipelineError> {
        let weights = self.models_dir.join(&descriptor.weights_file);
        if !weights.is_file() {
            warn!(model = %descriptor.name, "adding model whose weights file is not present yet");
        }
        self.config
            .set(&format!("{MODELS_SECTION}.{}", descriptor.name), &descriptor)?;
        info!(model = %descriptor.name, "model added to registry");
        self.models.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Update one model's confidence threshold, staging it in the config
    /// document. Takes effect on the next cycle's filtering.
    pub fn set_threshold(&mut self, name: &str, value: f64) -> Result<(), PipelineError> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "confidence threshold {value} outside (0, 1]"
            )));
        }
        let descriptor = self
            .models
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnknownModel(name.to_string()))?;
        descriptor.confidence_threshold = value;
        self.config
            .set(&format!("{MODELS_SECTION}.{name}.ConfidenceThreshold"), value)?;
        info!(model = %name, threshold = value, "confidence threshold updated");
        Ok(())
    }

    /// Current threshold for filtering, read live so threshold edits apply
    /// without re-activation.
    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.models.get(name).map(|m| m.confidence_threshold)
    }

    /// Handle to the active model, if any.
    pub fn active(&self) -> Option<ActiveModel> {
        self.active.clone()
    }

    pub fn active_descriptor(&self) -> Option<&ModelDescriptor> {
        self.active.as_ref().map(|a| &a.descriptor)
    }

    /// Swap the active reference. Callers load the pair first; only this
    /// swap happens under the registry lock.
    pub fn set_active(&mut self, active: ActiveModel) {
        info!(model = %active.descriptor.name, "active model swapped");
        self.active = Some(active);
    }
}
