//! Joint-space vectors and sensed joint state.
//!
//! Everything inside the crate works in radians (and rad/s). The sensing and
//! actuation collaborators speak degrees; conversion happens at that boundary
//! only, through [`JointState::from_degrees`] and [`to_degrees`].

use nalgebra::DVector;
use std::f64::consts::PI;
use tokio::time::Instant;

/// A joint configuration (rad) or joint velocity (rad/s).
pub type JointVector = DVector<f64>;

pub const DEG_TO_RAD: f64 = PI / 180.0;
pub const RAD_TO_DEG: f64 = 180.0 / PI;

/// Convert a slice of degrees into a radian joint vector.
pub fn from_degrees(values: &[f64]) -> JointVector {
    JointVector::from_iterator(values.len(), values.iter().map(|v| v * DEG_TO_RAD))
}

/// Convert a radian joint vector into degrees.
pub fn to_degrees(values: &JointVector) -> Vec<f64> {
    values.iter().map(|v| v * RAD_TO_DEG).collect()
}

/// Wrap an angle into `[-π, π)`.
pub fn wrap_angle(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

/// Component-wise `wrap(a - b)`. Both vectors must have the same length.
pub fn wrapped_difference(a: &JointVector, b: &JointVector) -> JointVector {
    a.zip_map(b, |x, y| wrap_angle(x - y))
}

/// True if every joint of `a` is strictly within `epsilon` of `b` (wrapped).
pub fn within(a: &JointVector, b: &JointVector, epsilon: f64) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| wrap_angle(x - y).abs() < epsilon)
}

/// One reading from the sensing collaborator.
///
/// Readings have no identity: each one supersedes the last.
#[derive(Clone, Debug, PartialEq)]
pub struct JointState {
    /// Joint angles (rad).
    pub position: JointVector,
    /// Joint torques, when the arm reports them.
    pub torque: Option<JointVector>,
    /// Monotonic instant the reading was taken or received. Stamped by
    /// [`SensorFeed::publish`](crate::input::SensorFeed::publish) when the
    /// producer leaves it empty.
    pub received: Option<Instant>,
}

impl JointState {
    pub fn new(position: JointVector) -> Self {
        Self {
            position,
            torque: None,
            received: None,
        }
    }

    pub fn with_torque(mut self, torque: JointVector) -> Self {
        self.torque = Some(torque);
        self
    }

    pub fn received_at(mut self, at: Instant) -> Self {
        self.received = Some(at);
        self
    }

    /// Build a reading from raw sensor values in degrees.
    pub fn from_degrees(angles: &[f64], torques: Option<&[f64]>) -> Self {
        Self {
            position: from_degrees(angles),
            torque: torques.map(|t| JointVector::from_vec(t.to_vec())),
            received: None,
        }
    }

    /// Number of joints in this reading.
    pub fn dof(&self) -> usize {
        self.position.len()
    }
}
