//! Human correction detection.
//!
//! A cycle counts as a correction only when at least one component of the
//! deviation lies strictly outside its deadband. Tracking error and sensor
//! noise below the band never produce an event.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::joint::{self, JointState, JointVector};

/// Which signal the detector watches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Observed joint velocity vs. commanded velocity.
    #[default]
    Velocity,
    /// Sensed joint torques.
    Torque,
    /// Operator device axes.
    Device,
}

/// Origin of a correction event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CorrectionSource {
    Motion,
    Torque,
    Device,
}

/// Deadbands for each detection signal.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    /// Per-joint velocity deadband (rad/s).
    pub velocity_epsilon: JointVector,
    /// Per-joint torque deadband. Torque detection is disabled without it.
    pub torque_threshold: Option<JointVector>,
    /// Deadband applied to every device axis.
    pub device_deadband: f64,
}

/// One cycle's worth of detector input.
#[derive(Clone, Copy, Debug)]
pub enum CorrectionInput<'a> {
    Motion {
        commanded: &'a JointVector,
        observed: &'a JointVector,
        state: &'a JointState,
    },
    Torque {
        state: &'a JointState,
    },
    Device {
        axes: &'a JointVector,
        state: &'a JointState,
    },
}

/// A detected correction, consumed by the learner.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionEvent {
    /// Deviation vector (rad/s for motion, sensor units for torque, raw axes for device).
    pub deviation: JointVector,
    pub source: CorrectionSource,
    /// Joint state at detection time.
    pub state: JointState,
}

impl CorrectionEvent {
    /// Unit-length deviation, or `None` for a zero vector.
    pub fn direction(&self) -> Option<JointVector> {
        let norm = self.deviation.norm();
        if norm > 0.0 && norm.is_finite() {
            Some(&self.deviation / norm)
        } else {
            None
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.deviation.norm()
    }
}

#[derive(Clone, Debug)]
pub struct CorrectionDetector {
    config: DetectorConfig,
}

impl CorrectionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Classify one cycle. Never blocks and has no side effects.
    pub fn detect(&self, input: CorrectionInput<'_>) -> Option<CorrectionEvent> {
        let (deviation, source, state) = match input {
            CorrectionInput::Motion {
                commanded,
                observed,
                state,
            } => {
                if commanded.len() != observed.len() {
                    tracing::debug!(
                        "Motion detection skipped: commanded {} vs observed {} joints",
                        commanded.len(),
                        observed.len()
                    );
                    return None;
                }
                (observed - commanded, CorrectionSource::Motion, state)
            }
            CorrectionInput::Torque { state } => {
                let torque = state.torque.as_ref()?;
                (torque.clone(), CorrectionSource::Torque, state)
            }
            CorrectionInput::Device { axes, state } => {
                (axes.clone(), CorrectionSource::Device, state)
            }
        };

        let exceeded = match source {
            CorrectionSource::Motion => exceeds(&deviation, &self.config.velocity_epsilon),
            CorrectionSource::Torque => match self.config.torque_threshold {
                Some(ref band) => exceeds(&deviation, band),
                None => false,
            },
            CorrectionSource::Device => deviation
                .iter()
                .any(|d| d.abs() > self.config.device_deadband),
        };

        if !exceeded {
            return None;
        }
        Some(CorrectionEvent {
            deviation,
            source,
            state: state.clone(),
        })
    }
}

/// Strict per-component comparison: `|d_i| > band_i` for some `i`.
fn exceeds(deviation: &JointVector, band: &JointVector) -> bool {
    if deviation.len() != band.len() {
        tracing::debug!(
            "Deadband has {} joints but deviation has {}",
            band.len(),
            deviation.len()
        );
        return false;
    }
    deviation
        .iter()
        .zip(band.iter())
        .any(|(d, b)| d.abs() > *b)
}

/// Finite-difference velocity estimate from successive readings, over the
/// instants the readings were taken.
#[derive(Clone, Debug, Default)]
pub struct VelocityEstimator {
    last: Option<(Instant, JointVector)>,
}

impl VelocityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fresh reading taken at `at`. Returns the velocity since the
    /// previous reading, or `None` for the first reading or a non-advancing
    /// timestamp.
    pub fn update(&mut self, position: &JointVector, at: Instant) -> Option<JointVector> {
        let velocity = match &self.last {
            Some((t, prev)) if at > *t && prev.len() == position.len() => {
                let dt = at.duration_since(*t).as_secs_f64();
                Some(joint::wrapped_difference(position, prev) / dt)
            }
            _ => None,
        };
        self.last = Some((at, position.clone()));
        velocity
    }

    /// Forget history, e.g. after a gap in the readings.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
