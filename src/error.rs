//! Error taxonomy for the pipeline core.
//!
//! Nothing here is fatal to the process: the orchestration loop logs and
//! keeps running across transient collaborator failures, and command
//! operations return these errors to the caller instead of panicking.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The frame store or a model-loading backend is temporarily
    /// unreachable. The loop retries with a fixed backoff.
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// Calibration precondition not met: fewer than four distinct markers
    /// were observed this cycle.
    #[error("insufficient markers for calibration: observed {found}, need at least 4")]
    InsufficientMarkers { found: usize },

    /// A marker required by one of the configured layout roles was not
    /// among the observed markers.
    #[error("marker {id} for the {role} role was not observed")]
    MissingRoleMarker { role: &'static str, id: u32 },

    #[error("unknown model `{0}`")]
    UnknownModel(String),

    /// A descriptor references a postprocessor key that is not registered.
    /// Rejected at activation time, never looked up mid-cycle.
    #[error("unknown postprocessor `{0}`")]
    UnknownPostprocessor(String),

    #[error("model weights file not found: {0}")]
    MissingWeights(PathBuf),

    /// The postprocessor capability failed. The cycle degrades to the raw
    /// detections and continues.
    #[error("postprocessor failed: {0}")]
    PostprocessorFault(String),

    /// Zero-sized rectified crop, a malformed frame, or degenerate marker
    /// geometry. The affected cycle is skipped.
    #[error("invalid frame geometry: {0}")]
    InvalidFrameGeometry(String),

    /// Configuration-store or other internal plumbing failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
