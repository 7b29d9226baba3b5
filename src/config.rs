//! Node configuration.
//!
//! The JSON layout mirrors the arm driver's parameter namespaces (`setup`,
//! `planner`, `controller`, `learner`, `detector`). Joint angles in `setup`
//! are degrees; everything handed to the rest of the crate is radians.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;

use crate::controller::ControlGains;
use crate::detector::{DetectionMode, DetectorConfig};
use crate::environment::Environment;
use crate::error::{Result, TeleopError};
use crate::joint::{self, JointVector};
use crate::learner::{Belief, Hypothesis, LearnerContext, ReplanPolicy};
use crate::planner::{LinearPlanner, Planner};
use crate::replan::PlanSettings;

/// Extra entries carried by goals that include finger angles.
pub const FINGER_JOINTS: usize = 3;

#[derive(Clone, Debug, Deserialize)]
pub struct TeleopConfig {
    pub setup: SetupConfig,
    pub planner: PlannerConfig,
    pub controller: ControllerConfig,
    pub learner: LearnerConfig,
    #[serde(default)]
    pub detector: DetectorSection,
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SetupConfig {
    /// Driver topic prefix, used in log lines.
    #[serde(default)]
    pub prefix: String,
    /// Start configuration (deg).
    pub start: Vec<f64>,
    /// Goal configurations (deg), optionally with finger angles appended.
    pub goals: Vec<Vec<f64>>,
    #[serde(default)]
    pub goal_pose: Option<Vec<f64>>,
    #[serde(rename = "T")]
    pub horizon: f64,
    pub timestep: f64,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default)]
    pub feat_list: Vec<String>,
    #[serde(default)]
    pub feat_weights: Vec<f64>,
    #[serde(default)]
    pub object_centers: BTreeMap<String, Vec<f64>>,
    /// Velocity deadband (rad/s), one value per joint or a single shared value.
    #[serde(rename = "INTERACTION_VELOCITY_EPSILON")]
    pub velocity_epsilon: Vec<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlannerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_num_waypts")]
    pub num_waypts: usize,
    /// Prior over goals. Uniform when omitted.
    #[serde(default)]
    pub belief: Option<Vec<f64>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub p_gain: f64,
    pub i_gain: f64,
    pub d_gain: f64,
    pub epsilon: f64,
    pub max_cmd: f64,
    #[serde(default)]
    pub integral_limit: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LearnerConfig {
    pub betas: Vec<f64>,
    #[serde(default = "default_replan_confidence")]
    pub replan_confidence: f64,
    #[serde(default = "default_replan_min_shift")]
    pub replan_min_shift: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DetectorSection {
    #[serde(default)]
    pub mode: DetectionMode,
    #[serde(default)]
    pub torque_threshold: Option<Vec<f64>>,
    #[serde(default = "default_device_deadband")]
    pub device_deadband: f64,
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            mode: DetectionMode::default(),
            torque_threshold: None,
            device_deadband: default_device_deadband(),
        }
    }
}

fn default_rate_hz() -> f64 {
    100.0
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_num_waypts() -> usize {
    5
}

fn default_replan_confidence() -> f64 {
    0.6
}

fn default_replan_min_shift() -> f64 {
    0.3
}

fn default_device_deadband() -> f64 {
    0.1
}

/// Expand a single shared value to `dof` entries.
fn per_joint(values: &[f64], dof: usize, name: &str) -> Result<JointVector> {
    match values.len() {
        1 => Ok(JointVector::from_element(dof, values[0])),
        n if n == dof => Ok(JointVector::from_vec(values.to_vec())),
        n => Err(TeleopError::config(format!(
            "{} has {} entries, expected 1 or {}",
            name, n, dof
        ))),
    }
}

/// Deadbands must be finite and non-negative: a negative band fires on every
/// cycle and NaN never fires.
fn non_negative(name: &str, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
        Some(v) => Err(TeleopError::config(format!(
            "{} must be finite and non-negative, got {}",
            name, v
        ))),
        None => Ok(()),
    }
}

impl TeleopConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config =
            Self::from_json(&text).with_context(|| format!("loading config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| TeleopError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let dof = self.dof();
        if dof == 0 {
            return Err(TeleopError::config("setup.start is empty"));
        }
        if self.planner.kind != "linear" {
            return Err(TeleopError::config(format!(
                "Planner {} not implemented.",
                self.planner.kind
            )));
        }
        if self.controller.kind != "pid" {
            return Err(TeleopError::config(format!(
                "Controller {} not implemented.",
                self.controller.kind
            )));
        }
        if self.setup.goals.is_empty() {
            return Err(TeleopError::config("setup.goals is empty"));
        }
        for (i, goal) in self.setup.goals.iter().enumerate() {
            if goal.len() != dof && goal.len() != dof + FINGER_JOINTS {
                return Err(TeleopError::config(format!(
                    "goal {} has {} entries, expected {} or {}",
                    i,
                    goal.len(),
                    dof,
                    dof + FINGER_JOINTS
                )));
            }
        }
        let positive = [
            ("setup.T", self.setup.horizon),
            ("setup.timestep", self.setup.timestep),
            ("rate_hz", self.rate_hz),
            ("controller.epsilon", self.controller.epsilon),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(TeleopError::config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        let c = &self.controller;
        if [c.p_gain, c.i_gain, c.d_gain, c.max_cmd]
            .iter()
            .any(|g| !g.is_finite() || *g < 0.0)
        {
            return Err(TeleopError::config("controller gains must be non-negative"));
        }
        if self.setup.feat_list.len() != self.setup.feat_weights.len() {
            return Err(TeleopError::config(format!(
                "{} features but {} weights",
                self.setup.feat_list.len(),
                self.setup.feat_weights.len()
            )));
        }
        if self.learner.betas.is_empty()
            || self.learner.betas.iter().any(|b| !b.is_finite() || *b <= 0.0)
        {
            return Err(TeleopError::config("learner.betas must be non-empty and positive"));
        }
        if let Some(limit) = c.integral_limit {
            if !(limit.is_finite() && limit > 0.0) {
                return Err(TeleopError::config(format!(
                    "controller.integral_limit must be positive, got {}",
                    limit
                )));
            }
        }
        if self.planner.num_waypts < 2 {
            return Err(TeleopError::config(format!(
                "planner.num_waypts must be at least 2, got {}",
                self.planner.num_waypts
            )));
        }
        let fractions = [
            ("learner.replan_confidence", self.learner.replan_confidence),
            ("learner.replan_min_shift", self.learner.replan_min_shift),
        ];
        for (name, value) in fractions {
            if !(0.0..=1.0).contains(&value) {
                return Err(TeleopError::config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        let det = self.detector()?;
        non_negative("INTERACTION_VELOCITY_EPSILON", det.velocity_epsilon.as_slice())?;
        if let Some(ref t) = det.torque_threshold {
            non_negative("detector.torque_threshold", t.as_slice())?;
        }
        non_negative("detector.device_deadband", &[det.device_deadband])?;
        self.prior()?;
        Ok(())
    }

    /// Number of arm joints, taken from the start configuration.
    pub fn dof(&self) -> usize {
        self.setup.start.len()
    }

    pub fn start(&self) -> JointVector {
        joint::from_degrees(&self.setup.start)
    }

    /// Goal configurations in radians, finger angles dropped.
    pub fn goals(&self) -> Vec<JointVector> {
        let dof = self.dof();
        self.setup
            .goals
            .iter()
            .map(|g| joint::from_degrees(&g[..dof.min(g.len())]))
            .collect()
    }

    pub fn gains(&self) -> ControlGains {
        let c = &self.controller;
        let gains = ControlGains::uniform(
            self.dof(),
            c.p_gain,
            c.i_gain,
            c.d_gain,
            c.epsilon,
            c.max_cmd,
        );
        match c.integral_limit {
            Some(limit) => gains.with_integral_limit(limit),
            None => gains,
        }
    }

    pub fn detector(&self) -> Result<DetectorConfig> {
        let dof = self.dof();
        Ok(DetectorConfig {
            velocity_epsilon: per_joint(
                &self.setup.velocity_epsilon,
                dof,
                "INTERACTION_VELOCITY_EPSILON",
            )?,
            torque_threshold: match self.detector.torque_threshold {
                Some(ref t) => Some(per_joint(t, dof, "detector.torque_threshold")?),
                None => None,
            },
            device_deadband: self.detector.device_deadband,
        })
    }

    /// Object centers plus one `GOAL<n> ANGLES` entry per goal.
    pub fn environment(&self) -> Environment {
        let mut env = Environment::new(self.setup.object_centers.clone());
        for goal in self.goals() {
            env.add_goal(goal);
        }
        env
    }

    /// One hypothesis per environment goal, all sharing the configured
    /// feature weights.
    pub fn learner_context(&self, environment: Arc<Environment>) -> LearnerContext {
        let hypotheses = environment
            .goals()
            .iter()
            .enumerate()
            .map(|(goal_index, goal)| Hypothesis {
                goal_index,
                goal: goal.clone(),
                weights: self.setup.feat_weights.clone(),
            })
            .collect();
        LearnerContext {
            hypotheses,
            feat_list: self.setup.feat_list.clone(),
            betas: self.learner.betas.clone(),
            environment,
        }
    }

    pub fn prior(&self) -> Result<Belief> {
        let n = self.setup.goals.len();
        match self.planner.belief {
            Some(ref b) if b.len() != n => Err(TeleopError::config(format!(
                "planner.belief has {} entries for {} goals",
                b.len(),
                n
            ))),
            Some(ref b) => Belief::new(b.clone()),
            None => Belief::uniform(n),
        }
    }

    pub fn replan_policy(&self) -> ReplanPolicy {
        ReplanPolicy {
            confidence: self.learner.replan_confidence,
            min_shift: self.learner.replan_min_shift,
        }
    }

    pub fn plan_settings(&self) -> PlanSettings {
        PlanSettings {
            horizon: self.setup.horizon,
            timestep: self.setup.timestep,
            goal_pose: self.setup.goal_pose.clone(),
            feat_list: self.setup.feat_list.clone(),
        }
    }

    pub fn build_planner(&self) -> Result<Arc<dyn Planner>> {
        match self.planner.kind.as_str() {
            "linear" => Ok(Arc::new(LinearPlanner::new(self.planner.num_waypts))),
            other => Err(TeleopError::config(format!("Planner {} not implemented.", other))),
        }
    }
}
