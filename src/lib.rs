//! teleop-inference - compliant trajectory tracking with online correction inference.
//!
//! A robot arm tracks a planned joint-space trajectory with a PID velocity
//! controller while in admittance mode. Physical or device corrections from a
//! human are detected, folded into a belief over candidate goals, and trigger
//! a replan when the belief shifts enough.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use teleop_inference::{
//!     DeviceFeed, LinearPlanner, SensorFeed, SimConfig, SimulatedArm, TeleopConfig, TeleopNode,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = TeleopConfig::load("config/jaco_teleop.json")?;
//! let (sensor, _) = SensorFeed::channel();
//! let (device, _) = DeviceFeed::channel();
//! let (arm, _handle) = SimulatedArm::new(config.start(), sensor.clone(), SimConfig::default());
//!
//! let planner = config.build_planner()?;
//! let (node, _handles) = TeleopNode::new(&config, planner, arm, &sensor, &device)?;
//! let summary = node.run(CancellationToken::new()).await?;
//! println!("{:?}", summary.progress);
//! # Ok(())
//! # }
//! ```

pub mod actuation;
pub mod config;
pub mod controller;
pub mod detector;
pub mod environment;
pub mod error;
pub mod input;
pub mod joint;
pub mod learner;
pub mod node;
pub mod planner;
pub mod recorder;
pub mod replan;
pub mod sim;
pub mod trajectory;

pub use actuation::{Actuator, AdmittanceGuard};
pub use config::TeleopConfig;
pub use controller::{ControlGains, PidController, ProgressState};
pub use detector::{
    CorrectionDetector, CorrectionEvent, CorrectionInput, CorrectionSource, DetectionMode,
    DetectorConfig,
};
pub use environment::Environment;
pub use error::{Result, TeleopError};
pub use input::{DeviceFeed, SensorFeed};
pub use joint::{JointState, JointVector};
pub use learner::{Belief, BeliefModel, BoltzmannGoalModel, Learner, ReplanPolicy};
pub use node::{NodeHandles, RunSummary, TeleopNode};
pub use planner::{LinearPlanner, PlanRequest, Planner};
pub use replan::{InstalledPlan, ReplanRequest};
pub use sim::{SimArmHandle, SimConfig, SimulatedArm};
pub use trajectory::Trajectory;
