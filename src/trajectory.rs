//! Time-indexed reference trajectories.
//!
//! A [`Trajectory`] is created once by a planner and never mutated afterwards.
//! The loop shares it as `Arc<Trajectory>` and replaces it wholesale on replan.

use serde::Serialize;

use crate::error::{Result, TeleopError};
use crate::joint::JointVector;

/// Ordered waypoints tagged with their time offset from the trajectory start.
///
/// Invariants (checked by [`Trajectory::new`]):
/// - at least one waypoint, all with the same number of joints
/// - the first time offset is zero
/// - time offsets are finite and strictly increasing
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    waypts: Vec<JointVector>,
    times: Vec<f64>,
}

/// Serializable form of a trajectory, as written to recordings.
#[derive(Clone, Debug, Serialize)]
pub struct TrajectorySnapshot {
    pub times: Vec<f64>,
    pub waypts: Vec<Vec<f64>>,
}

impl Trajectory {
    /// Build a trajectory, validating its invariants.
    pub fn new(waypts: Vec<JointVector>, times: Vec<f64>) -> Result<Self> {
        if waypts.is_empty() {
            return Err(TeleopError::invalid_trajectory("no waypoints"));
        }
        if waypts.len() != times.len() {
            return Err(TeleopError::invalid_trajectory(format!(
                "{} waypoints but {} time stamps",
                waypts.len(),
                times.len()
            )));
        }
        let dof = waypts[0].len();
        if dof == 0 {
            return Err(TeleopError::invalid_trajectory("zero-dimensional waypoints"));
        }
        if let Some((i, w)) = waypts.iter().enumerate().find(|(_, w)| w.len() != dof) {
            return Err(TeleopError::invalid_trajectory(format!(
                "waypoint {} has {} joints, expected {}",
                i,
                w.len(),
                dof
            )));
        }
        if waypts.iter().any(|w| w.iter().any(|x| !x.is_finite())) {
            return Err(TeleopError::invalid_trajectory("non-finite joint value"));
        }
        if times[0] != 0.0 {
            return Err(TeleopError::invalid_trajectory(format!(
                "first time offset must be 0, got {}",
                times[0]
            )));
        }
        for pair in times.windows(2) {
            if !pair[1].is_finite() || pair[1] <= pair[0] {
                return Err(TeleopError::invalid_trajectory(format!(
                    "time offsets not strictly increasing ({} then {})",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self { waypts, times })
    }

    /// A single-waypoint trajectory that holds `position`.
    pub fn hold(position: JointVector) -> Result<Self> {
        Self::new(vec![position], vec![0.0])
    }

    /// Number of joints per waypoint.
    pub fn dof(&self) -> usize {
        self.waypts[0].len()
    }

    pub fn num_waypts(&self) -> usize {
        self.waypts.len()
    }

    pub fn waypoints(&self) -> &[JointVector] {
        &self.waypts
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// First waypoint.
    pub fn start(&self) -> &JointVector {
        &self.waypts[0]
    }

    /// Last waypoint.
    pub fn goal(&self) -> &JointVector {
        &self.waypts[self.waypts.len() - 1]
    }

    /// Time offset of the last waypoint (s).
    pub fn duration(&self) -> f64 {
        self.times[self.times.len() - 1]
    }

    /// Index `i` of the segment `[times[i], times[i+1])` containing `t`,
    /// or `None` when `t` lies outside the trajectory.
    fn segment(&self, t: f64) -> Option<usize> {
        if self.waypts.len() < 2 || t.is_nan() || t < 0.0 || t >= self.duration() {
            return None;
        }
        let idx = self.times.partition_point(|&x| x <= t);
        Some(idx - 1)
    }

    /// Reference configuration at time `t`, linearly interpolated.
    ///
    /// Holds the start before `0` and the goal after `duration()`.
    pub fn interpolate(&self, t: f64) -> JointVector {
        match self.segment(t) {
            Some(i) => {
                let (t0, t1) = (self.times[i], self.times[i + 1]);
                let alpha = (t - t0) / (t1 - t0);
                let (a, b) = (&self.waypts[i], &self.waypts[i + 1]);
                a + (b - a) * alpha
            }
            None if t.is_nan() || t < 0.0 => self.start().clone(),
            None => self.goal().clone(),
        }
    }

    /// Reference velocity at time `t` (rad/s). Zero outside the trajectory.
    pub fn velocity(&self, t: f64) -> JointVector {
        match self.segment(t) {
            Some(i) => {
                let dt = self.times[i + 1] - self.times[i];
                (&self.waypts[i + 1] - &self.waypts[i]) / dt
            }
            None => JointVector::zeros(self.dof()),
        }
    }

    /// Resample to `n` waypoints evenly spaced over the same duration.
    ///
    /// Endpoints are preserved. `n` may exceed the current waypoint count.
    pub fn downsample(&self, n: usize) -> Result<Self> {
        if n < 2 {
            return Err(TeleopError::config(format!(
                "cannot downsample to {} waypoints (need at least 2)",
                n
            )));
        }
        if self.waypts.len() < 2 {
            return Err(TeleopError::invalid_trajectory(
                "cannot resample a zero-duration trajectory",
            ));
        }
        let duration = self.duration();
        let times: Vec<f64> = (0..n)
            .map(|k| duration * k as f64 / (n - 1) as f64)
            .collect();
        let mut waypts: Vec<JointVector> = times.iter().map(|&t| self.interpolate(t)).collect();
        // interpolate() at t == duration already returns the goal; pin it exactly
        waypts[n - 1] = self.goal().clone();
        Self::new(waypts, times)
    }

    pub fn snapshot(&self) -> TrajectorySnapshot {
        TrajectorySnapshot {
            times: self.times.clone(),
            waypts: self.waypts.iter().map(|w| w.as_slice().to_vec()).collect(),
        }
    }
}
