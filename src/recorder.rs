//! Run recording: per-cycle samples, installed plans and belief snapshots,
//! written as one JSON file when the node stops.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::Serialize;

use crate::controller::ProgressState;
use crate::joint::JointVector;
use crate::learner::Belief;
use crate::replan::InstalledPlan;
use crate::trajectory::TrajectorySnapshot;

#[derive(Clone, Debug, Serialize)]
pub struct CycleSample {
    pub t: f64,
    /// Sensed position (rad).
    pub position: Vec<f64>,
    /// Reference the controller steered toward (rad).
    pub reference: Option<Vec<f64>>,
    /// Reference velocity (rad/s).
    pub reference_velocity: Option<Vec<f64>>,
    /// Published command (rad/s).
    pub command: Vec<f64>,
    pub progress: ProgressState,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlanRecord {
    pub t: f64,
    pub generation: u64,
    pub hypothesis: Option<usize>,
    /// Belief the plan was made under.
    pub belief: Vec<f64>,
    pub trajectory: TrajectorySnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct BeliefRecord {
    pub t: f64,
    pub probabilities: Vec<f64>,
}

#[derive(Serialize)]
struct RecordingFile<'a> {
    created_unix: u64,
    samples: &'a [CycleSample],
    plans: &'a [PlanRecord],
    beliefs: &'a [BeliefRecord],
}

pub struct Recorder {
    save_dir: PathBuf,
    num_waypts: usize,
    samples: Vec<CycleSample>,
    plans: Vec<PlanRecord>,
    beliefs: Vec<BeliefRecord>,
}

impl Recorder {
    /// Plans are stored downsampled to `num_waypts` waypoints.
    pub fn new(save_dir: impl Into<PathBuf>, num_waypts: usize) -> Self {
        Self {
            save_dir: save_dir.into(),
            num_waypts,
            samples: Vec::new(),
            plans: Vec::new(),
            beliefs: Vec::new(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn record_cycle(
        &mut self,
        t: f64,
        position: &JointVector,
        reference: Option<&JointVector>,
        reference_velocity: Option<&JointVector>,
        command: &JointVector,
        progress: ProgressState,
    ) {
        self.samples.push(CycleSample {
            t,
            position: position.as_slice().to_vec(),
            reference: reference.map(|r| r.as_slice().to_vec()),
            reference_velocity: reference_velocity.map(|v| v.as_slice().to_vec()),
            command: command.as_slice().to_vec(),
            progress,
        });
    }

    pub fn record_plan(&mut self, t: f64, plan: &InstalledPlan) {
        let trajectory = match plan.trajectory.downsample(self.num_waypts) {
            Ok(d) => d.snapshot(),
            Err(e) => {
                tracing::debug!("Recording full plan ({})", e);
                plan.trajectory.snapshot()
            }
        };
        self.plans.push(PlanRecord {
            t,
            generation: plan.generation,
            hypothesis: plan.hypothesis,
            belief: plan.belief.probabilities().to_vec(),
            trajectory,
        });
    }

    pub fn record_belief(&mut self, t: f64, belief: &Belief) {
        self.beliefs.push(BeliefRecord {
            t,
            probabilities: belief.probabilities().to_vec(),
        });
    }

    pub fn samples(&self) -> &[CycleSample] {
        &self.samples
    }

    pub fn plans(&self) -> &[PlanRecord] {
        &self.plans
    }

    pub fn beliefs(&self) -> &[BeliefRecord] {
        &self.beliefs
    }

    /// Write `recording_<unix secs>.json` into the save directory.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::fs::create_dir_all(&self.save_dir)
            .with_context(|| format!("creating {}", self.save_dir.display()))?;
        let path = self
            .save_dir
            .join(format!("recording_{}.json", created_unix));

        let file = RecordingFile {
            created_unix,
            samples: &self.samples,
            plans: &self.plans,
            beliefs: &self.beliefs,
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(
            "Saved {} samples and {} plans to {}",
            self.samples.len(),
            self.plans.len(),
            path.display()
        );
        Ok(path)
    }
}
