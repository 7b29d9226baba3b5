//! Planner collaborator contract and the built-in straight-line planner.
//!
//! The loop only depends on [`Planner`]. A trajectory optimizer plugs in by
//! implementing it; [`LinearPlanner`] is the reference implementation used by
//! the node binary and the tests.

use crate::error::{Result, TeleopError};
use crate::joint::JointVector;
use crate::trajectory::Trajectory;

/// Everything a planner needs to produce a trajectory.
#[derive(Clone, Debug)]
pub struct PlanRequest {
    /// Start configuration (rad). For replans this is the current sensed state.
    pub start: JointVector,
    /// Goal configuration (rad).
    pub goal: JointVector,
    /// Optional Cartesian goal pose for planners that support it.
    pub goal_pose: Option<Vec<f64>>,
    /// Feature names, aligned with `weights`.
    pub feat_list: Vec<String>,
    pub weights: Vec<f64>,
    /// Planning horizon `T` (s).
    pub horizon: f64,
    /// Waypoint spacing (s).
    pub timestep: f64,
    /// Belief over goal hypotheses, when planning under uncertainty.
    pub belief: Option<Vec<f64>>,
}

/// A trajectory planner.
///
/// `plan` may be slow; the replan worker calls it on the blocking pool.
pub trait Planner: Send + Sync {
    fn plan(&self, request: &PlanRequest) -> Result<Trajectory>;

    /// Waypoint count used when downsampling plans for recording.
    fn num_waypts(&self) -> usize;
}

/// Straight line in joint space, sampled every `timestep` over the horizon.
#[derive(Clone, Debug)]
pub struct LinearPlanner {
    num_waypts: usize,
}

impl LinearPlanner {
    pub fn new(num_waypts: usize) -> Self {
        Self { num_waypts }
    }
}

impl Planner for LinearPlanner {
    fn plan(&self, request: &PlanRequest) -> Result<Trajectory> {
        let PlanRequest {
            start,
            goal,
            horizon,
            timestep,
            ..
        } = request;

        if start.len() != goal.len() {
            return Err(TeleopError::planning(format!(
                "start has {} joints but goal has {}",
                start.len(),
                goal.len()
            )));
        }
        if !(horizon.is_finite() && *horizon > 0.0) {
            return Err(TeleopError::planning(format!("invalid horizon {}", horizon)));
        }
        if !(timestep.is_finite() && *timestep > 0.0) || timestep > horizon {
            return Err(TeleopError::planning(format!(
                "invalid timestep {} for horizon {}",
                timestep, horizon
            )));
        }
        if request.goal_pose.is_some() {
            tracing::debug!("LinearPlanner ignores goal_pose; planning in joint space");
        }

        let steps = ((horizon / timestep).round() as usize).max(1);
        let times: Vec<f64> = (0..=steps)
            .map(|k| horizon * k as f64 / steps as f64)
            .collect();
        let waypts: Vec<JointVector> = (0..=steps)
            .map(|k| {
                let alpha = k as f64 / steps as f64;
                start + (goal - start) * alpha
            })
            .collect();

        Trajectory::new(waypts, times).map_err(|e| TeleopError::planning(e.to_string()))
    }

    fn num_waypts(&self) -> usize {
        self.num_waypts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(horizon: f64, timestep: f64) -> PlanRequest {
        PlanRequest {
            start: JointVector::zeros(7),
            goal: JointVector::from_element(7, 1.0),
            goal_pose: None,
            feat_list: vec!["table".into()],
            weights: vec![1.0],
            horizon,
            timestep,
            belief: None,
        }
    }

    #[test]
    fn test_linear_plan_shape() {
        let planner = LinearPlanner::new(5);
        let traj = planner.plan(&request(5.0, 0.1)).unwrap();
        assert_eq!(traj.num_waypts(), 51);
        assert!((traj.duration() - 5.0).abs() < 1e-12);
        assert_eq!(traj.start(), &JointVector::zeros(7));
        assert_eq!(traj.goal(), &JointVector::from_element(7, 1.0));
        let mid = traj.interpolate(2.5);
        assert!((mid[4] - 0.5).abs() < 1e-9);
        assert_eq!(planner.num_waypts(), 5);
    }

    #[test]
    fn test_linear_plan_rejects_bad_requests() {
        let planner = LinearPlanner::new(5);
        assert!(matches!(
            planner.plan(&request(0.0, 0.1)),
            Err(TeleopError::PlanningFailed(_))
        ));
        assert!(planner.plan(&request(5.0, 0.0)).is_err());
        assert!(planner.plan(&request(5.0, 6.0)).is_err());

        let mut bad = request(5.0, 0.1);
        bad.goal = JointVector::zeros(6);
        assert!(planner.plan(&bad).is_err());
    }

    #[test]
    fn test_uneven_timestep_still_ends_at_horizon() {
        let traj = LinearPlanner::new(5).plan(&request(1.0, 0.3)).unwrap();
        assert!((traj.duration() - 1.0).abs() < 1e-12);
        assert_eq!(traj.num_waypts(), 4);
    }
}
