//! The real-time tracking node.
//!
//! [`TeleopNode`] owns the controller and the detector and runs one control
//! cycle per tick. The learner and the replan worker run as separate tasks and
//! talk to the loop only through channels:
//!
//! ```text
//!  SensorFeed ──watch──▶ ┌────────────┐ ──publish_velocity──▶ Actuator
//!  DeviceFeed ──watch──▶ │  control   │
//!                        │   loop     │ ──mpsc (events)──▶ LearnerTask
//!  ReplanTrigger ─watch─▶└────────────┘                        │
//!        ▲                                                      │
//!        └──────────────watch (ReplanRequest)───────────────────┘
//! ```
//!
//! The loop never waits on either task: it drains whatever plan or belief is
//! ready at the start of a cycle and moves on. The replan worker reports each
//! settled request and each new plan back to the learner.
//!
//! Observed joint velocity is measured between the instants readings were
//! taken, not between control ticks, so a skipped tick or a burst of readings
//! does not look like a human pushing the arm.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::actuation::{Actuator, AdmittanceGuard};
use crate::config::TeleopConfig;
use crate::controller::{PidController, ProgressState};
use crate::detector::{
    CorrectionDetector, CorrectionEvent, CorrectionInput, DetectionMode, VelocityEstimator,
};
use crate::error::{Result, TeleopError};
use crate::input::{DeviceFeed, SensorFeed};
use crate::joint::{self, JointState, JointVector};
use crate::learner::{
    Belief, BeliefModel, BoltzmannGoalModel, Learner, LearnerTask, ReplanFeedback,
};
use crate::planner::Planner;
use crate::recorder::Recorder;
use crate::replan::{
    InstalledPlan, PlanSettings, ReplanCounts, ReplanRequest, ReplanStats, ReplanTrigger,
};

/// Readers for watching a node from outside.
#[derive(Clone)]
pub struct NodeHandles {
    pub belief: watch::Receiver<Arc<Belief>>,
    pub plans: watch::Receiver<InstalledPlan>,
    pub replan_stats: Arc<ReplanStats>,
}

/// Per-cycle counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub overruns: u64,
    pub corrections: u64,
    pub mismatches: u64,
    pub publish_failures: u64,
    pub stale_warnings: u64,
}

/// What a finished run looked like.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub stats: CycleStats,
    pub progress: ProgressState,
    pub plan_generation: u64,
    pub belief: Vec<f64>,
    pub replans: ReplanCounts,
    pub recording: Option<PathBuf>,
}

/// Parts that move into the background tasks when the node starts running.
struct Background {
    learner: Learner,
    events: mpsc::UnboundedReceiver<CorrectionEvent>,
    belief_tx: watch::Sender<Arc<Belief>>,
    replan_tx: watch::Sender<Option<ReplanRequest>>,
    replan_rx: watch::Receiver<Option<ReplanRequest>>,
    plans_tx: watch::Sender<InstalledPlan>,
    settled_tx: watch::Sender<u64>,
    feedback: ReplanFeedback,
    planner: Arc<dyn Planner>,
    settings: PlanSettings,
    sensor: watch::Receiver<Option<JointState>>,
}

/// Everything one control cycle touches, apart from the actuator.
struct ControlLoop {
    controller: PidController,
    detector: CorrectionDetector,
    mode: DetectionMode,
    velocity: VelocityEstimator,
    sensor: watch::Receiver<Option<JointState>>,
    device: watch::Receiver<Option<JointVector>>,
    plans: watch::Receiver<InstalledPlan>,
    belief: watch::Receiver<Arc<Belief>>,
    events: mpsc::UnboundedSender<CorrectionEvent>,
    recorder: Recorder,
    /// Loop time zero; stands in for reading timestamps a producer left out.
    epoch: Instant,
    state: Option<JointState>,
    last_cmd: JointVector,
    progress: ProgressState,
    generation: u64,
    stale_cycles: u64,
    stale_after: u64,
    warn_every: u64,
    prefix: String,
    stats: CycleStats,
}

pub struct TeleopNode<A: Actuator> {
    control: ControlLoop,
    actuator: A,
    background: Option<Background>,
    replan_stats: Arc<ReplanStats>,
    rate_hz: f64,
    dof: usize,
}

impl<A: Actuator> TeleopNode<A> {
    /// Build a node using [`BoltzmannGoalModel`] for belief updates.
    pub fn new(
        config: &TeleopConfig,
        planner: Arc<dyn Planner>,
        actuator: A,
        sensor: &SensorFeed,
        device: &DeviceFeed,
    ) -> Result<(Self, NodeHandles)> {
        Self::new_with_model(
            config,
            planner,
            Box::new(BoltzmannGoalModel),
            actuator,
            sensor,
            device,
        )
    }

    /// Build a node and compute the initial plan.
    ///
    /// Fails on invalid configuration or when the initial plan cannot be made.
    pub fn new_with_model(
        config: &TeleopConfig,
        planner: Arc<dyn Planner>,
        model: Box<dyn BeliefModel>,
        actuator: A,
        sensor: &SensorFeed,
        device: &DeviceFeed,
    ) -> Result<(Self, NodeHandles)> {
        config.validate()?;
        let dof = config.dof();

        let environment = Arc::new(config.environment());
        let context = Arc::new(config.learner_context(environment));
        let prior = config.prior()?;
        let learner = Learner::new(context, model, prior.clone(), config.replan_policy())?;

        // plan toward the most likely goal under the prior
        let settings = config.plan_settings();
        let (target, _) = prior.map();
        let hypothesis = &learner.context().hypotheses[target];
        let request = settings.request(
            config.start(),
            hypothesis.goal.clone(),
            hypothesis.weights.clone(),
            Some(prior.probabilities().to_vec()),
        );
        let trajectory = planner.plan(&request)?;
        if trajectory.dof() != dof {
            return Err(TeleopError::planning(format!(
                "initial plan has {} joints, expected {}",
                trajectory.dof(),
                dof
            )));
        }
        let trajectory = Arc::new(trajectory);
        tracing::info!(
            "Initial plan toward goal {}: {} waypoints over {:.1}s",
            target,
            trajectory.num_waypts(),
            trajectory.duration()
        );

        let mut controller = PidController::new(config.gains());
        controller.set_trajectory(trajectory.clone())?;

        let initial = InstalledPlan {
            generation: 0,
            trajectory,
            hypothesis: Some(target),
            belief: Arc::new(prior.clone()),
        };
        let mut recorder = Recorder::new(config.setup.save_dir.clone(), planner.num_waypts());
        recorder.record_plan(0.0, &initial);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (belief_tx, belief_rx) = watch::channel(Arc::new(prior));
        let (replan_tx, replan_rx) = watch::channel(None);
        let (plans_tx, plans_rx) = watch::channel(initial);
        let (settled_tx, settled_rx) = watch::channel(0);
        let replan_stats = Arc::new(ReplanStats::default());

        let handles = NodeHandles {
            belief: belief_rx.clone(),
            plans: plans_rx.clone(),
            replan_stats: replan_stats.clone(),
        };

        let rate_hz = config.rate_hz;
        let control = ControlLoop {
            controller,
            detector: CorrectionDetector::new(config.detector()?),
            mode: config.detector.mode,
            velocity: VelocityEstimator::new(),
            sensor: sensor.subscribe(),
            device: device.subscribe(),
            plans: plans_rx,
            belief: belief_rx,
            events: events_tx,
            recorder,
            epoch: Instant::now(),
            state: sensor.latest(),
            last_cmd: JointVector::zeros(dof),
            progress: ProgressState::NotStarted,
            generation: 0,
            stale_cycles: 0,
            stale_after: (rate_hz / 2.0).ceil().max(1.0) as u64,
            warn_every: rate_hz.ceil().max(1.0) as u64,
            prefix: config.setup.prefix.clone(),
            stats: CycleStats::default(),
        };

        let background = Background {
            learner,
            events: events_rx,
            belief_tx,
            replan_tx,
            replan_rx,
            feedback: ReplanFeedback::new(plans_tx.subscribe(), settled_rx),
            plans_tx,
            settled_tx,
            planner,
            settings,
            sensor: sensor.subscribe(),
        };

        let node = Self {
            control,
            actuator,
            background: Some(background),
            replan_stats,
            rate_hz,
            dof,
        };
        Ok((node, handles))
    }

    /// Run exactly one control cycle at loop time `now` (s) and return the
    /// published command (rad/s).
    pub fn step(&mut self, now: f64) -> JointVector {
        self.control.step(&mut self.actuator, now)
    }

    pub fn progress(&self) -> ProgressState {
        self.control.controller.progress()
    }

    pub fn controller(&self) -> &PidController {
        &self.control.controller
    }

    pub fn last_command(&self) -> &JointVector {
        &self.control.last_cmd
    }

    pub fn stats(&self) -> CycleStats {
        self.control.stats
    }

    pub fn recorder(&self) -> &Recorder {
        &self.control.recorder
    }

    pub fn plan_generation(&self) -> u64 {
        self.control.generation
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Run at the configured rate until `cancel` fires.
    ///
    /// The actuator is in admittance mode for the whole run and is released
    /// on every exit path, including this future being dropped.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<RunSummary> {
        let background = self
            .background
            .take()
            .context("node background tasks already started")?;

        let tasks = cancel.child_token();
        let _stop_tasks = tasks.clone().drop_guard();

        let learner = LearnerTask::spawn(
            background.learner,
            background.events,
            background.feedback,
            background.belief_tx,
            background.replan_tx,
            tasks.child_token(),
        );
        let replan = ReplanTrigger::new(
            background.planner,
            background.settings,
            background.sensor,
            background.replan_rx,
            background.plans_tx,
            background.settled_tx,
            self.replan_stats.clone(),
        )
        .spawn(tasks.child_token());

        let period = Duration::from_secs_f64(1.0 / self.rate_hz);
        tracing::info!(
            "Control loop starting at {:.0} Hz ({:?} detection)",
            self.rate_hz,
            self.control.mode
        );

        let mut guard = AdmittanceGuard::engage(&mut self.actuator)
            .context("failed to enter admittance mode")?;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let start = Instant::now();
        self.control.epoch = start;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let cycle_start = Instant::now();
            let now = start.elapsed().as_secs_f64();
            self.control.step(&mut *guard, now);

            if cycle_start.elapsed() > period {
                self.control.stats.overruns += 1;
                if (self.control.stats.overruns - 1) % self.control.warn_every == 0 {
                    tracing::warn!(
                        "Control cycle overran its {:?} period ({} overruns)",
                        period,
                        self.control.stats.overruns
                    );
                }
            }
        }

        if let Err(e) = guard.release() {
            tracing::error!("Failed to leave admittance mode: {}", e);
        }

        tasks.cancel();
        if let Err(e) = learner.await {
            tracing::error!("Learner task failed: {}", e);
        }
        if let Err(e) = replan.await {
            tracing::error!("Replan task failed: {}", e);
        }

        // pick up anything published while shutting down
        if self.control.belief.has_changed().unwrap_or(false) {
            let belief = self.control.belief.borrow_and_update().clone();
            self.control.recorder.record_belief(start.elapsed().as_secs_f64(), &belief);
        }

        let recording = match self.control.recorder.save() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!("Failed to save recording: {:#}", e);
                None
            }
        };

        let summary = RunSummary {
            stats: self.control.stats,
            progress: self.control.controller.progress(),
            plan_generation: self.control.generation,
            belief: self.control.belief.borrow().probabilities().to_vec(),
            replans: self.replan_stats.snapshot(),
            recording,
        };
        tracing::info!(
            "Control loop stopped after {} cycles ({})",
            summary.stats.cycles,
            summary.progress
        );
        Ok(summary)
    }
}

impl ControlLoop {
    fn step<T: Actuator + ?Sized>(&mut self, actuator: &mut T, now: f64) -> JointVector {
        self.stats.cycles += 1;
        self.install_pending_plan(now);
        self.refresh_belief(now);
        let fresh = self.read_state();

        let command = self.compute_command(now);
        self.detect(fresh, now);

        let deg = joint::to_degrees(&command);
        if let Err(e) = actuator.publish_velocity(&deg) {
            self.stats.publish_failures += 1;
            tracing::warn!("{}: failed to publish command: {}", self.prefix, e);
        }
        self.last_cmd = command.clone();

        if let Some(ref state) = self.state {
            let progress = self.controller.progress();
            let reference = self.controller.reference(now);
            let reference_velocity = self.controller.reference_velocity(now);
            self.recorder.record_cycle(
                now,
                &state.position,
                reference.as_ref(),
                reference_velocity.as_ref(),
                &command,
                progress,
            );
            if progress != self.progress {
                tracing::info!("Progress {} -> {} at t={:.2}s", self.progress, progress, now);
                self.progress = progress;
            }
        }
        command
    }

    fn install_pending_plan(&mut self, now: f64) {
        if !self.plans.has_changed().unwrap_or(false) {
            return;
        }
        let plan = self.plans.borrow_and_update().clone();
        if plan.generation <= self.generation {
            return;
        }
        match self.controller.set_trajectory(plan.trajectory.clone()) {
            Ok(()) => {
                tracing::info!(
                    "Installed plan generation {} ({:.1}s)",
                    plan.generation,
                    plan.trajectory.duration()
                );
                self.generation = plan.generation;
                self.recorder.record_plan(now, &plan);
            }
            Err(e) => tracing::warn!("Rejected plan generation {}: {}", plan.generation, e),
        }
    }

    fn refresh_belief(&mut self, now: f64) {
        if self.belief.has_changed().unwrap_or(false) {
            let belief = self.belief.borrow_and_update().clone();
            tracing::debug!("Belief now {:?}", belief.probabilities());
            self.recorder.record_belief(now, &belief);
        }
    }

    /// Take the newest reading, if there is one. Returns whether it is fresh.
    fn read_state(&mut self) -> bool {
        if self.sensor.has_changed().unwrap_or(false) {
            if let Some(state) = self.sensor.borrow_and_update().clone() {
                self.state = Some(state);
                self.stale_cycles = 0;
                return true;
            }
        }
        if self.state.is_some() {
            self.stale_cycles += 1;
            if self.stale_cycles == self.stale_after {
                self.stats.stale_warnings += 1;
                self.velocity.reset();
                tracing::warn!(
                    "{}: no joint reading for {} cycles, holding last state",
                    self.prefix,
                    self.stale_cycles
                );
            }
        }
        false
    }

    fn compute_command(&mut self, now: f64) -> JointVector {
        let Some(ref state) = self.state else {
            return JointVector::zeros(self.last_cmd.len());
        };
        match self.controller.get_command(&state.position, now) {
            Ok(cmd) => cmd,
            Err(e @ TeleopError::DimensionMismatch { .. }) => {
                self.stats.mismatches += 1;
                if (self.stats.mismatches - 1) % self.warn_every == 0 {
                    tracing::warn!("{}; holding previous command", e);
                }
                self.last_cmd.clone()
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("{}; holding previous command", e);
                self.last_cmd.clone()
            }
            Err(e) => {
                tracing::error!("{}; stopping the arm", e);
                JointVector::zeros(self.last_cmd.len())
            }
        }
    }

    fn detect(&mut self, fresh: bool, now: f64) {
        let Some(ref state) = self.state else {
            return;
        };
        let event = match self.mode {
            DetectionMode::Velocity => {
                if !fresh {
                    return;
                }
                let at = state
                    .received
                    .unwrap_or_else(|| self.epoch + Duration::from_secs_f64(now.max(0.0)));
                let Some(observed) = self.velocity.update(&state.position, at) else {
                    return;
                };
                self.detector.detect(CorrectionInput::Motion {
                    commanded: &self.last_cmd,
                    observed: &observed,
                    state,
                })
            }
            DetectionMode::Torque => {
                if !fresh {
                    return;
                }
                self.detector.detect(CorrectionInput::Torque { state })
            }
            DetectionMode::Device => {
                let Some(axes) = self.device.borrow().clone() else {
                    return;
                };
                self.detector.detect(CorrectionInput::Device { axes: &axes, state })
            }
        };
        let Some(event) = event else {
            return;
        };

        self.stats.corrections += 1;
        tracing::debug!(
            "Correction ({:?}, magnitude {:.3}) at t={:.2}s",
            event.source,
            event.magnitude(),
            now
        );
        if self.events.send(event).is_err() {
            tracing::debug!("Learner gone; dropping correction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::planner::{LinearPlanner, PlanRequest};
    use crate::trajectory::Trajectory;

    #[derive(Default)]
    struct Log {
        published: Vec<Vec<f64>>,
        admittance: bool,
    }

    impl Actuator for Log {
        fn publish_velocity(&mut self, deg_per_s: &[f64]) -> anyhow::Result<()> {
            self.published.push(deg_per_s.to_vec());
            Ok(())
        }

        fn start_admittance(&mut self) -> anyhow::Result<()> {
            self.admittance = true;
            Ok(())
        }

        fn stop_admittance(&mut self) -> anyhow::Result<()> {
            self.admittance = false;
            Ok(())
        }
    }

    fn node() -> (TeleopNode<Log>, SensorFeed, NodeHandles) {
        let config = TeleopConfig::from_json(&sample_json()).unwrap();
        let (sensor, _rx) = SensorFeed::channel();
        let (device, _rx) = DeviceFeed::channel();
        let (node, handles) = TeleopNode::new(
            &config,
            Arc::new(LinearPlanner::new(5)),
            Log::default(),
            &sensor,
            &device,
        )
        .unwrap();
        (node, sensor, handles)
    }

    #[test]
    fn test_zero_command_before_first_reading() {
        let (mut node, _sensor, _handles) = node();
        let cmd = node.step(0.0);
        assert_eq!(cmd, JointVector::zeros(7));
        assert_eq!(node.actuator().published, vec![vec![0.0; 7]]);
        assert_eq!(node.progress(), ProgressState::NotStarted);
    }

    #[test]
    fn test_initial_plan_targets_map_goal() {
        let (node, _sensor, handles) = node();
        let plan = handles.plans.borrow().clone();
        assert_eq!(plan.generation, 0);
        assert_eq!(plan.hypothesis, Some(0));
        assert!((plan.trajectory.duration() - 20.0).abs() < 1e-9);
        assert_eq!(node.recorder().plans().len(), 1);
        assert_eq!(node.recorder().plans()[0].trajectory.waypts.len(), 5);
    }

    #[test]
    fn test_command_published_in_degrees() {
        let (mut node, sensor, _handles) = node();
        // 1 degree short on the first joint of the start configuration
        sensor.publish_degrees(&[179.0, 90.0, 180.0, 130.0, 180.0, 180.0, 190.0], None);
        let cmd = node.step(0.0);
        let published = &node.actuator().published[0];
        assert!(cmd[0] > 0.0);
        assert!((published[0] - cmd[0].to_degrees()).abs() < 1e-9);
        assert_eq!(node.progress(), ProgressState::Tracking);
    }

    #[test]
    fn test_dimension_mismatch_holds_previous_command() {
        let (mut node, sensor, _handles) = node();
        sensor.publish_degrees(&[170.0, 90.0, 180.0, 130.0, 180.0, 180.0, 190.0], None);
        let first = node.step(0.0);
        sensor.publish_degrees(&[170.0; 6], None);
        let held = node.step(0.01);
        assert_eq!(first, held);
        assert_eq!(node.stats().mismatches, 1);
        assert_eq!(node.actuator().published.len(), 2);
    }

    #[test]
    fn test_missing_readings_reuse_last_state() {
        let (mut node, sensor, _handles) = node();
        sensor.publish_degrees(&[180.0, 90.0, 180.0, 130.0, 180.0, 180.0, 190.0], None);
        for k in 0..60 {
            node.step(k as f64 * 0.01);
        }
        assert_eq!(node.stats().cycles, 60);
        assert_eq!(node.stats().stale_warnings, 1);
        assert_eq!(node.recorder().samples().len(), 60);
    }

    #[test]
    fn test_new_rejects_failing_initial_plan() {
        struct Broken;
        impl Planner for Broken {
            fn plan(&self, _r: &PlanRequest) -> Result<Trajectory> {
                Err(TeleopError::planning("infeasible"))
            }
            fn num_waypts(&self) -> usize {
                5
            }
        }
        let config = TeleopConfig::from_json(&sample_json()).unwrap();
        let (sensor, _rx) = SensorFeed::channel();
        let (device, _rx) = DeviceFeed::channel();
        let result = TeleopNode::new(&config, Arc::new(Broken), Log::default(), &sensor, &device);
        assert!(matches!(result, Err(TeleopError::PlanningFailed(_))));
    }
}
