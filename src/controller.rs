//! PID velocity controller with an explicit path-progress state machine.
//!
//! The controller first draws the arm to the trajectory's start waypoint. Once
//! every joint is within `epsilon` of it, tracking begins and the reference
//! follows the trajectory in time. The first time every joint comes within
//! `epsilon` of the last waypoint, the goal is marked as reached.
//!
//! ```text
//! NotStarted ──(start proximity)──▶ Tracking ──(goal proximity)──▶ ReachedGoal
//!      ▲                                                               │
//!      └──────────────────────── set_trajectory ◀──────────────────────┘
//! ```

use std::sync::Arc;

use crate::error::{Result, TeleopError};
use crate::joint::{self, JointVector};
use crate::trajectory::Trajectory;

/// Diagonal PID gains plus proximity and saturation limits.
#[derive(Clone, Debug)]
pub struct ControlGains {
    pub p: JointVector,
    pub i: JointVector,
    pub d: JointVector,
    /// Proximity threshold for start/goal detection (rad).
    pub epsilon: f64,
    /// Per-joint maximum command magnitude (rad/s).
    pub max_cmd: JointVector,
    /// Clamp on each integral component. `None` leaves the integral unbounded.
    pub integral_limit: Option<f64>,
}

impl ControlGains {
    /// Same gains on every joint (the `gain * I` form).
    pub fn uniform(dof: usize, p: f64, i: f64, d: f64, epsilon: f64, max_cmd: f64) -> Self {
        Self {
            p: JointVector::from_element(dof, p),
            i: JointVector::from_element(dof, i),
            d: JointVector::from_element(dof, d),
            epsilon,
            max_cmd: JointVector::from_element(dof, max_cmd.abs()),
            integral_limit: None,
        }
    }

    pub fn with_integral_limit(mut self, limit: f64) -> Self {
        self.integral_limit = Some(limit.abs());
        self
    }

    pub fn dof(&self) -> usize {
        self.p.len()
    }
}

/// Phase of trajectory tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ProgressState {
    NotStarted,
    Tracking,
    ReachedGoal,
}

impl std::fmt::Display for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressState::NotStarted => "not-started",
            ProgressState::Tracking => "tracking",
            ProgressState::ReachedGoal => "reached-goal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
struct PidState {
    integral: JointVector,
    prev_error: Option<JointVector>,
    prev_time: Option<f64>,
}

impl PidState {
    fn new(dof: usize) -> Self {
        Self {
            integral: JointVector::zeros(dof),
            prev_error: None,
            prev_time: None,
        }
    }

    fn update(&mut self, gains: &ControlGains, error: JointVector, now: f64) -> JointVector {
        let dt = self.prev_time.map(|t| now - t).filter(|dt| *dt > 0.0);
        let derivative = match (dt, &self.prev_error) {
            (Some(dt), Some(prev)) => (&error - prev) / dt,
            _ => JointVector::zeros(error.len()),
        };
        if let Some(dt) = dt {
            self.integral += &error * dt;
            if let Some(limit) = gains.integral_limit {
                for x in self.integral.iter_mut() {
                    *x = x.clamp(-limit, limit);
                }
            }
        }

        let output = gains.p.component_mul(&error)
            + gains.i.component_mul(&self.integral)
            + gains.d.component_mul(&derivative);

        self.prev_error = Some(error);
        self.prev_time = Some(now);
        output
    }
}

/// Velocity controller tracking one trajectory at a time.
#[derive(Clone, Debug)]
pub struct PidController {
    gains: ControlGains,
    trajectory: Option<Arc<Trajectory>>,
    path_start_t: Option<f64>,
    path_end_t: Option<f64>,
    pid: PidState,
}

impl PidController {
    pub fn new(gains: ControlGains) -> Self {
        let dof = gains.dof();
        Self {
            gains,
            trajectory: None,
            path_start_t: None,
            path_end_t: None,
            pid: PidState::new(dof),
        }
    }

    /// Install a trajectory and restart progress from `NotStarted`.
    pub fn set_trajectory(&mut self, trajectory: Arc<Trajectory>) -> Result<()> {
        if trajectory.dof() != self.gains.dof() {
            return Err(TeleopError::DimensionMismatch {
                expected: self.gains.dof(),
                actual: trajectory.dof(),
            });
        }
        self.trajectory = Some(trajectory);
        self.path_start_t = None;
        self.path_end_t = None;
        self.pid = PidState::new(self.gains.dof());
        Ok(())
    }

    pub fn trajectory(&self) -> Option<&Arc<Trajectory>> {
        self.trajectory.as_ref()
    }

    pub fn gains(&self) -> &ControlGains {
        &self.gains
    }

    /// Time (loop clock, s) the start waypoint was first reached.
    pub fn path_start_t(&self) -> Option<f64> {
        self.path_start_t
    }

    /// Time (loop clock, s) the goal waypoint was first reached.
    pub fn path_end_t(&self) -> Option<f64> {
        self.path_end_t
    }

    pub fn progress(&self) -> ProgressState {
        match (self.path_start_t, self.path_end_t) {
            (_, Some(_)) => ProgressState::ReachedGoal,
            (Some(_), None) => ProgressState::Tracking,
            (None, None) => ProgressState::NotStarted,
        }
    }

    /// Accumulated integral error.
    pub fn integral(&self) -> &JointVector {
        &self.pid.integral
    }

    /// Reference configuration the controller is steering toward at `now`.
    pub fn reference(&self, now: f64) -> Option<JointVector> {
        let traj = self.trajectory.as_ref()?;
        Some(match self.path_start_t {
            Some(t0) => traj.interpolate(now - t0),
            None => traj.start().clone(),
        })
    }

    /// Velocity of the reference at `now` (rad/s). Zero until tracking starts.
    pub fn reference_velocity(&self, now: f64) -> Option<JointVector> {
        let traj = self.trajectory.as_ref()?;
        Some(match self.path_start_t {
            Some(t0) => traj.velocity(now - t0),
            None => JointVector::zeros(traj.dof()),
        })
    }

    /// Compute the velocity command (rad/s) for the current position.
    ///
    /// `now` is the loop clock in seconds; it must not go backwards.
    pub fn get_command(&mut self, position: &JointVector, now: f64) -> Result<JointVector> {
        let traj = self
            .trajectory
            .clone()
            .ok_or(TeleopError::NoActiveTrajectory)?;
        if position.len() != traj.dof() {
            return Err(TeleopError::DimensionMismatch {
                expected: traj.dof(),
                actual: position.len(),
            });
        }

        if self.path_start_t.is_none() && joint::within(position, traj.start(), self.gains.epsilon)
        {
            self.path_start_t = Some(now);
            tracing::debug!("Path start reached at t={:.3}s", now);
        }
        if self.path_start_t.is_some()
            && self.path_end_t.is_none()
            && joint::within(position, traj.goal(), self.gains.epsilon)
        {
            self.path_end_t = Some(now);
            tracing::debug!("Path end reached at t={:.3}s", now);
        }

        let reference = match self.path_start_t {
            Some(t0) => traj.interpolate(now - t0),
            None => traj.start().clone(),
        };
        let error = joint::wrapped_difference(&reference, position);
        let raw = self.pid.update(&self.gains, error, now);
        Ok(self.saturate(raw))
    }

    fn saturate(&self, mut cmd: JointVector) -> JointVector {
        for (c, max) in cmd.iter_mut().zip(self.gains.max_cmd.iter()) {
            *c = if c.is_finite() { c.clamp(-max, *max) } else { 0.0 };
        }
        cmd
    }
}
