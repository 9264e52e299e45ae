//! Calibration estimation and atomic commit.
//!
//! Given four role markers observed in one frame, estimates the rigid
//! transform of the work surface plus independent X/Y scale factors:
//!
//! ```text
//! theta = atan2(P1.y - P0.y, P1.x - P0.x)
//! RT[:2,:2] = Rᵗ          RT[:2,2] = -Rᵗ · P0
//! transform = diag(real_dx / |P1-P0|, real_dy / |P3-P0|, 1) · RT
//! ```
//!
//! Estimation is pure; the `Calibrator` owns commit and persistence. A
//! failed estimate never mutates the shared state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use nalgebra::Point2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::PipelineError;
use crate::markers::MarkerObservation;

use super::state::CalibrationState;

/// Config section the calibration state persists under.
const CALIBRATION_SECTION: &str = "CalibrationData";
/// Config section describing the marker layout.
const LAYOUT_SECTION: &str = "Markers";

/// One logical role in the marker layout: which marker, and which of its
/// four corners, anchors that role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarkerRole {
    pub id: u32,
    pub corner: usize,
}

/// Configured mapping from the four layout roles to physical markers, plus
/// the real-world distances between the origin and its X/Y neighbors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MarkerLayout {
    pub origin: MarkerRole,
    pub x_axis: MarkerRole,
    pub diagonal: MarkerRole,
    pub y_axis: MarkerRole,
    pub x_distance: f64,
    pub y_distance: f64,
}

impl MarkerLayout {
    pub fn validate(&self) -> Result<()> {
        for role in [&self.origin, &self.x_axis, &self.diagonal, &self.y_axis] {
            ensure!(role.corner < 4, "marker corner index {} out of range", role.corner);
        }
        ensure!(
            self.x_distance > 0.0 && self.x_distance.is_finite(),
            "marker X distance must be positive"
        );
        ensure!(
            self.y_distance > 0.0 && self.y_distance.is_finite(),
            "marker Y distance must be positive"
        );
        Ok(())
    }
}

/// Caller-facing summary of a committed calibration.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSummary {
    pub origin: Point2<f64>,
    pub theta: f64,
    pub size: (u32, u32),
    pub scale_x: f64,
    pub scale_y: f64,
}

impl From<&CalibrationState> for CalibrationSummary {
    fn from(state: &CalibrationState) -> Self {
        Self {
            origin: state.origin,
            theta: state.theta,
            size: state.size,
            scale_x: state.scale_x,
            scale_y: state.scale_y,
        }
    }
}

/// Estimate a full calibration from one cycle's marker observations.
///
/// Fails without side effects when fewer than four markers are observed,
/// when any configured role's marker is absent, or when the axis markers
/// coincide (zero-sized crop).
pub fn estimate(
    layout: &MarkerLayout,
    markers: &HashMap<u32, MarkerObservation>,
) -> Result<CalibrationState, PipelineError> {
    if markers.len() < 4 {
        return Err(PipelineError::InsufficientMarkers { found: markers.len() });
    }

    let p0 = role_point(markers, &layout.origin, "origin")?;
    let p1 = role_point(markers, &layout.x_axis, "x-axis")?;
    // The diagonal marker is not used by the rigid estimate, but its absence
    // still fails the precondition: all four roles must be visible.
    let _p2 = role_point(markers, &layout.diagonal, "diagonal")?;
    let p3 = role_point(markers, &layout.y_axis, "y-axis")?;

    let dx_px = (p1 - p0).norm();
    let dy_px = (p3 - p0).norm();
    if dx_px < 1.0 || dy_px < 1.0 {
        return Err(PipelineError::InvalidFrameGeometry(
            "axis markers coincide, rectified crop would be empty".to_string(),
        ));
    }

    let theta = (p1.y - p0.y).atan2(p1.x - p0.x);
    let mut state = CalibrationState {
        calibrated: true,
        origin: p0,
        theta,
        size: (dx_px.ceil() as u32, dy_px.ceil() as u32),
        scale_x: layout.x_distance / dx_px,
        scale_y: layout.y_distance / dy_px,
        transform: nalgebra::Matrix3::identity(),
    };
    state.transform = state.scale_matrix() * state.rigid_transform();
    Ok(state)
}

fn role_point(
    markers: &HashMap<u32, MarkerObservation>,
    role: &MarkerRole,
    name: &'static str,
) -> Result<Point2<f64>, PipelineError> {
    let marker = markers
        .get(&role.id)
        .ok_or(PipelineError::MissingRoleMarker { role: name, id: role.id })?;
    marker
        .corner(role.corner)
        .ok_or_else(|| anyhow!("corner index {} out of range for marker {}", role.corner, role.id).into())
}

/// Owns calibration commit and persistence. The shared `CalibrationState`
/// slot itself lives in the pipeline's shared state; the calibrator is handed
/// a reference so commits happen in one lock acquisition.
pub struct Calibrator {
    config: Arc<ConfigStore>,
}

impl Calibrator {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// Reload the persisted calibration at startup. A missing or inconsistent
    /// section yields the uncalibrated state.
    pub fn load_state(&self) -> CalibrationState {
        match self.config.section::<CalibrationState>(CALIBRATION_SECTION) {
            Ok(state) if state.is_consistent() => state,
            Ok(_) => {
                warn!("stored calibration is internally inconsistent, starting uncalibrated");
                CalibrationState::uncalibrated()
            }
            Err(_) => {
                debug!("no stored calibration, starting uncalibrated");
                CalibrationState::uncalibrated()
            }
        }
    }

    /// The configured marker layout.
    pub fn layout(&self) -> Result<MarkerLayout, PipelineError> {
        let layout: MarkerLayout = self.config.section(LAYOUT_SECTION)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Estimate from the given observations, persist, and only then swap the
    /// shared state in one lock acquisition. All-or-nothing: any failure,
    /// including a failed persist, leaves the shared state on the previous
    /// calibration and memory and disk never disagree.
    pub fn calibrate(
        &self,
        slot: &Mutex<CalibrationState>,
        markers: &HashMap<u32, MarkerObservation>,
    ) -> Result<CalibrationSummary, PipelineError> {
        let layout = self.layout()?;
        let state = estimate(&layout, markers)?;
        let summary = CalibrationSummary::from(&state);

        self.persist(&state)?;
        *slot.lock() = state.clone();

        info!(
            theta_deg = state.theta.to_degrees(),
            origin_x = state.origin.x,
            origin_y = state.origin.y,
            width = state.size.0,
            height = state.size.1,
            scale_x = state.scale_x,
            scale_y = state.scale_y,
            "calibration committed"
        );
        Ok(summary)
    }

    /// Clear the calibration and persist, same ordering as `calibrate`.
    /// Idempotent.
    pub fn uncalibrate(&self, slot: &Mutex<CalibrationState>) -> Result<(), PipelineError> {
        let state = CalibrationState::uncalibrated();
        self.persist(&state)?;
        *slot.lock() = state.clone();
        info!("calibration cleared");
        Ok(())
    }

    fn persist(&self, state: &CalibrationState) -> Result<(), PipelineError> {
        self.config.set(CALIBRATION_SECTION, state)?;
        self.config.save()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn square_marker(id: u32, corner: Point2<f64>) -> MarkerObservation {
        MarkerObservation::new(
            id,
            [
                corner,
                Point2::new(corner.x + 10.0, corner.y),
                Point2::new(corner.x + 10.0, corner.y + 10.0),
                Point2::new(corner.x, corner.y + 10.0),
            ],
        )
    }

    fn layout() -> MarkerLayout {
        MarkerLayout {
            origin: MarkerRole { id: 0, corner: 0 },
            x_axis: MarkerRole { id: 1, corner: 0 },
            diagonal: MarkerRole { id: 2, corner: 0 },
            y_axis: MarkerRole { id: 3, corner: 0 },
            x_distance: 400.0,
            y_distance: 300.0,
        }
    }

    fn axis_aligned_markers() -> HashMap<u32, MarkerObservation> {
        [
            (0, square_marker(0, Point2::new(100.0, 100.0))),
            (1, square_marker(1, Point2::new(500.0, 100.0))),
            (2, square_marker(2, Point2::new(500.0, 400.0))),
            (3, square_marker(3, Point2::new(100.0, 400.0))),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn axis_aligned_square_scenario() {
        let state = estimate(&layout(), &axis_aligned_markers()).unwrap();

        assert!(state.calibrated);
        assert_relative_eq!(state.theta, 0.0, epsilon = 1e-12);
        assert_eq!(state.size, (400, 300));
        assert_relative_eq!(state.scale_x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(state.scale_y, 1.0, epsilon = 1e-12);
        assert!(state.is_consistent());
    }

    #[test]
    fn transform_maps_axis_markers_to_real_distances() {
        let state = estimate(&layout(), &axis_aligned_markers()).unwrap();

        let x_marker = state.transform * Vector3::new(500.0, 100.0, 1.0);
        assert_relative_eq!(x_marker.x, 400.0, epsilon = 1e-9);
        assert_relative_eq!(x_marker.y, 0.0, epsilon = 1e-9);

        let y_marker = state.transform * Vector3::new(100.0, 400.0, 1.0);
        assert_relative_eq!(y_marker.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(y_marker.y, 300.0, epsilon = 1e-9);
    }

    #[test]
    fn rotated_layout_round_trips_real_distances() {
        // Rotate the square 30 degrees about the origin marker.
        let theta = 30f64.to_radians();
        let pivot = Point2::new(100.0, 100.0);
        let rotate = |p: Point2<f64>| {
            let d = p - pivot;
            Point2::new(
                pivot.x + d.x * theta.cos() - d.y * theta.sin(),
                pivot.y + d.x * theta.sin() + d.y * theta.cos(),
            )
        };
        let markers: HashMap<u32, MarkerObservation> = [
            (0, square_marker(0, rotate(Point2::new(100.0, 100.0)))),
            (1, square_marker(1, rotate(Point2::new(500.0, 100.0)))),
            (2, square_marker(2, rotate(Point2::new(500.0, 400.0)))),
            (3, square_marker(3, rotate(Point2::new(100.0, 400.0)))),
        ]
        .into_iter()
        .collect();

        let state = estimate(&layout(), &markers).unwrap();
        assert_relative_eq!(state.theta, theta, epsilon = 1e-9);

        let p1 = markers[&1].corners[0];
        let mapped = state.transform * Vector3::new(p1.x, p1.y, 1.0);
        assert_relative_eq!(mapped.x, 400.0, epsilon = 1e-9);
        assert_relative_eq!(mapped.y, 0.0, epsilon = 1e-9);

        let p3 = markers[&3].corners[0];
        let mapped = state.transform * Vector3::new(p3.x, p3.y, 1.0);
        assert_relative_eq!(mapped.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(mapped.y, 300.0, epsilon = 1e-9);
    }

    #[test]
    fn too_few_markers_fails_without_side_effects() {
        let markers: HashMap<u32, MarkerObservation> = [
            (0, square_marker(0, Point2::new(100.0, 100.0))),
            (1, square_marker(1, Point2::new(500.0, 100.0))),
        ]
        .into_iter()
        .collect();

        assert!(matches!(
            estimate(&layout(), &markers),
            Err(PipelineError::InsufficientMarkers { found: 2 })
        ));
    }

    #[test]
    fn missing_role_marker_is_reported() {
        let mut markers = axis_aligned_markers();
        markers.remove(&3);
        markers.insert(9, square_marker(9, Point2::new(0.0, 0.0)));

        assert!(matches!(
            estimate(&layout(), &markers),
            Err(PipelineError::MissingRoleMarker { role: "y-axis", id: 3 })
        ));
    }

    #[test]
    fn coincident_axis_markers_are_degenerate() {
        let mut markers = axis_aligned_markers();
        markers.insert(1, square_marker(1, Point2::new(100.0, 100.0)));

        assert!(matches!(
            estimate(&layout(), &markers),
            Err(PipelineError::InvalidFrameGeometry(_))
        ));
    }

    #[test]
    fn failed_calibrate_leaves_state_and_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        config.set(LAYOUT_SECTION, layout()).unwrap();

        let calibrator = Calibrator::new(config.clone());
        let slot = Mutex::new(CalibrationState::uncalibrated());

        let good = calibrator.calibrate(&slot, &axis_aligned_markers()).unwrap();
        assert_eq!(good.size, (400, 300));

        let before = slot.lock().clone();
        let err = calibrator.calibrate(&slot, &HashMap::new());
        assert!(matches!(err, Err(PipelineError::InsufficientMarkers { found: 0 })));
        assert_eq!(*slot.lock(), before);

        // Persisted copy still holds the successful calibration.
        let reloaded = Calibrator::new(config).load_state();
        assert_eq!(reloaded, before);
    }

    #[test]
    fn failed_persist_leaves_shared_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the config directory should be makes save()
        // fail while estimation itself succeeds.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let config = Arc::new(ConfigStore::open(blocker.join("config.json")).unwrap());
        config.set(LAYOUT_SECTION, layout()).unwrap();

        let calibrator = Calibrator::new(config);
        let slot = Mutex::new(CalibrationState::uncalibrated());

        assert!(calibrator.calibrate(&slot, &axis_aligned_markers()).is_err());
        assert!(!slot.lock().calibrated);

        // Same rule for clearing: a failed persist keeps the old state.
        *slot.lock() = estimate(&layout(), &axis_aligned_markers()).unwrap();
        assert!(calibrator.uncalibrate(&slot).is_err());
        assert!(slot.lock().calibrated);
    }

    #[test]
    fn uncalibrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        config.set(LAYOUT_SECTION, layout()).unwrap();

        let calibrator = Calibrator::new(config);
        let slot = Mutex::new(CalibrationState::uncalibrated());
        calibrator.calibrate(&slot, &axis_aligned_markers()).unwrap();

        calibrator.uncalibrate(&slot).unwrap();
        let once = slot.lock().clone();
        calibrator.uncalibrate(&slot).unwrap();
        assert_eq!(*slot.lock(), once);
        assert!(!once.calibrated);
    }

    #[test]
    fn readers_never_observe_a_partial_commit() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::open(dir.path().join("config.json")).unwrap());
        config.set(LAYOUT_SECTION, layout()).unwrap();

        let calibrator = Calibrator::new(config);
        let slot = Mutex::new(CalibrationState::uncalibrated());
        let markers = axis_aligned_markers();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let snapshot = slot.lock().clone();
                    assert!(snapshot.is_consistent());
                    if snapshot.calibrated {
                        assert_eq!(snapshot.size, (400, 300));
                    } else {
                        assert_eq!(snapshot.size, (0, 0));
                    }
                }
            });

            for _ in 0..200 {
                calibrator.calibrate(&slot, &markers).unwrap();
                calibrator.uncalibrate(&slot).unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
        });
    }
}
