//! Background replanning.
//!
//! The learner drops [`ReplanRequest`]s into a single-slot `watch` channel;
//! [`ReplanTrigger`] picks up the newest one, plans from the arm's current
//! configuration on the blocking pool and publishes the result as an
//! [`InstalledPlan`] for the control loop to swap in at the start of a cycle.
//!
//! Requests that arrive while a plan is being computed are coalesced: only the
//! latest is planned next, and the in-flight result is dropped as stale.
//! Whatever happens to a request, its sequence number goes out on the
//! `settled` channel so the learner knows it may ask again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TeleopError;
use crate::joint::{JointState, JointVector};
use crate::learner::Belief;
use crate::planner::{PlanRequest, Planner};
use crate::trajectory::Trajectory;

/// Ask for a new trajectory toward a hypothesis.
#[derive(Clone, Debug)]
pub struct ReplanRequest {
    /// Increasing per learner; reported back once the request is settled.
    pub seq: u64,
    /// Index of the MAP hypothesis.
    pub hypothesis: usize,
    pub goal: JointVector,
    pub weights: Vec<f64>,
    /// Belief at the time of the request.
    pub belief: Arc<Belief>,
    /// Joint state at detection time. Used as the start when no reading is available.
    pub state: JointState,
}

/// Planning parameters shared by the initial plan and every replan.
#[derive(Clone, Debug)]
pub struct PlanSettings {
    pub horizon: f64,
    pub timestep: f64,
    pub goal_pose: Option<Vec<f64>>,
    pub feat_list: Vec<String>,
}

impl PlanSettings {
    pub fn request(
        &self,
        start: JointVector,
        goal: JointVector,
        weights: Vec<f64>,
        belief: Option<Vec<f64>>,
    ) -> PlanRequest {
        PlanRequest {
            start,
            goal,
            goal_pose: self.goal_pose.clone(),
            feat_list: self.feat_list.clone(),
            weights,
            horizon: self.horizon,
            timestep: self.timestep,
            belief,
        }
    }
}

/// A trajectory ready to be installed by the control loop.
#[derive(Clone, Debug)]
pub struct InstalledPlan {
    /// Strictly increasing; 0 is the initial plan.
    pub generation: u64,
    pub trajectory: Arc<Trajectory>,
    /// Hypothesis the plan targets, if known.
    pub hypothesis: Option<usize>,
    /// Belief the plan was made under.
    pub belief: Arc<Belief>,
}

/// Replan counters, shared with the node handles.
#[derive(Debug, Default)]
pub struct ReplanStats {
    pub invocations: AtomicU64,
    pub installed: AtomicU64,
    pub discarded: AtomicU64,
    pub failures: AtomicU64,
}

/// Plain copy of [`ReplanStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplanCounts {
    pub invocations: u64,
    pub installed: u64,
    pub discarded: u64,
    pub failures: u64,
}

impl ReplanStats {
    pub fn snapshot(&self) -> ReplanCounts {
        ReplanCounts {
            invocations: self.invocations.load(Ordering::Relaxed),
            installed: self.installed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

pub struct ReplanTrigger {
    planner: Arc<dyn Planner>,
    settings: PlanSettings,
    dof: usize,
    sensor: watch::Receiver<Option<JointState>>,
    requests: watch::Receiver<Option<ReplanRequest>>,
    plans: watch::Sender<InstalledPlan>,
    settled: watch::Sender<u64>,
    stats: Arc<ReplanStats>,
}

impl ReplanTrigger {
    /// Plans must match the joint count of the plan already in `plans`.
    pub fn new(
        planner: Arc<dyn Planner>,
        settings: PlanSettings,
        sensor: watch::Receiver<Option<JointState>>,
        requests: watch::Receiver<Option<ReplanRequest>>,
        plans: watch::Sender<InstalledPlan>,
        settled: watch::Sender<u64>,
        stats: Arc<ReplanStats>,
    ) -> Self {
        let dof = plans.borrow().trajectory.dof();
        Self {
            planner,
            settings,
            dof,
            sensor,
            requests,
            plans,
            settled,
            stats,
        }
    }

    /// Run until `cancel` fires or the request sender goes away.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = self.requests.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Replan request channel closed");
                            break;
                        }
                    }
                }
                let Some(request) = self.requests.borrow_and_update().clone() else {
                    continue;
                };
                let seq = request.seq;
                if !self.replan(request, &cancel).await {
                    break;
                }
                self.settled.send_replace(seq);
            }
            tracing::debug!("Replan worker stopped");
        })
    }

    /// Plan for one request. Returns false if cancelled mid-plan.
    async fn replan(&mut self, request: ReplanRequest, cancel: &CancellationToken) -> bool {
        let start = self
            .sensor
            .borrow()
            .as_ref()
            .map(|s| s.position.clone())
            .filter(|p| p.len() == self.dof)
            .unwrap_or_else(|| request.state.position.clone());

        let plan_request = self.settings.request(
            start,
            request.goal.clone(),
            request.weights.clone(),
            Some(request.belief.probabilities().to_vec()),
        );
        self.stats.invocations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Replanning toward hypothesis {}", request.hypothesis);

        let planner = Arc::clone(&self.planner);
        let work = tokio::task::spawn_blocking(move || planner.plan(&plan_request));
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Replan abandoned on shutdown");
                return false;
            }
            joined = work => joined,
        };

        let outcome = match joined {
            Ok(Ok(trajectory)) => self.validate(trajectory),
            Ok(Err(e)) => Err(TeleopError::ReplanFailed(e.to_string())),
            Err(e) => Err(TeleopError::ReplanFailed(format!("planner task failed: {}", e))),
        };
        let trajectory = match outcome {
            Ok(t) => t,
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}; keeping the current trajectory", e);
                return true;
            }
        };

        if self.requests.has_changed().unwrap_or(false) {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Discarding plan for hypothesis {}: newer request pending",
                request.hypothesis
            );
            return true;
        }

        let generation = self.plans.borrow().generation + 1;
        self.plans.send_replace(InstalledPlan {
            generation,
            trajectory: Arc::new(trajectory),
            hypothesis: Some(request.hypothesis),
            belief: request.belief.clone(),
        });
        self.stats.installed.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Plan generation {} ready", generation);
        true
    }

    fn validate(&self, trajectory: Trajectory) -> Result<Trajectory, TeleopError> {
        if trajectory.dof() != self.dof {
            return Err(TeleopError::ReplanFailed(format!(
                "planner returned {} joints, expected {}",
                trajectory.dof(),
                self.dof
            )));
        }
        if trajectory.duration() <= 0.0 {
            return Err(TeleopError::ReplanFailed(
                "planner returned a zero-length trajectory".into(),
            ));
        }
        Ok(trajectory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::planner::LinearPlanner;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Blocks each `plan` call until released, reporting the goal it got.
    struct GatedPlanner {
        inner: LinearPlanner,
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
        started: mpsc::UnboundedSender<JointVector>,
        calls: Mutex<Vec<PlanRequest>>,
    }

    impl Planner for GatedPlanner {
        fn plan(&self, request: &PlanRequest) -> Result<Trajectory> {
            self.calls.lock().unwrap().push(request.clone());
            let _ = self.started.send(request.goal.clone());
            let _ = self.gate.lock().unwrap().recv();
            self.inner.plan(request)
        }

        fn num_waypts(&self) -> usize {
            self.inner.num_waypts()
        }
    }

    struct FailingPlanner;

    impl Planner for FailingPlanner {
        fn plan(&self, _request: &PlanRequest) -> Result<Trajectory> {
            Err(TeleopError::planning("no solution"))
        }

        fn num_waypts(&self) -> usize {
            5
        }
    }

    fn settings() -> PlanSettings {
        PlanSettings {
            horizon: 5.0,
            timestep: 0.5,
            goal_pose: None,
            feat_list: vec!["table".into()],
        }
    }

    fn request(hypothesis: usize, goal: f64) -> ReplanRequest {
        ReplanRequest {
            seq: hypothesis as u64,
            hypothesis,
            goal: JointVector::from_element(3, goal),
            weights: vec![1.0],
            belief: Arc::new(Belief::uniform(3).unwrap()),
            state: JointState::new(JointVector::from_element(3, 0.25)),
        }
    }

    fn initial_plan(dof: usize) -> InstalledPlan {
        InstalledPlan {
            generation: 0,
            trajectory: Arc::new(Trajectory::hold(JointVector::zeros(dof)).unwrap()),
            hypothesis: Some(0),
            belief: Arc::new(Belief::uniform(3).unwrap()),
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_requests_coalesce_while_planning() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let planner = Arc::new(GatedPlanner {
            inner: LinearPlanner::new(5),
            gate: Mutex::new(gate_rx),
            started: started_tx,
            calls: Mutex::new(Vec::new()),
        });

        let (_sensor, sensor_rx) = crate::input::SensorFeed::channel();
        let (request_tx, request_rx) = watch::channel(None);
        let (plans_tx, mut plans_rx) = watch::channel(initial_plan(3));
        let (settled_tx, _settled_rx) = watch::channel(0);
        let stats = Arc::new(ReplanStats::default());
        let cancel = CancellationToken::new();

        let handle = ReplanTrigger::new(
            planner.clone(),
            settings(),
            sensor_rx,
            request_rx,
            plans_tx,
            settled_tx,
            stats.clone(),
        )
        .spawn(cancel.clone());

        request_tx.send_replace(Some(request(1, 1.0)));
        let first = started_rx.recv().await.unwrap();
        assert_eq!(first, JointVector::from_element(3, 1.0));

        // two more while the first is still planning
        request_tx.send_replace(Some(request(2, 2.0)));
        request_tx.send_replace(Some(request(3, 3.0)));
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        plans_rx.changed().await.unwrap();
        let plan = plans_rx.borrow_and_update().clone();
        assert_eq!(plan.generation, 1);
        assert_eq!(plan.hypothesis, Some(3));
        assert_eq!(plan.trajectory.goal(), &JointVector::from_element(3, 3.0));

        let goals: Vec<f64> = planner
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.goal[0])
            .collect();
        assert_eq!(goals, vec![1.0, 3.0]);
        assert_eq!(
            stats.snapshot(),
            ReplanCounts {
                invocations: 2,
                installed: 1,
                discarded: 1,
                failures: 0
            }
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_latest_sensed_state() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let (started_tx, _started_rx) = mpsc::unbounded_channel();
        let planner = Arc::new(GatedPlanner {
            inner: LinearPlanner::new(5),
            gate: Mutex::new(gate_rx),
            started: started_tx,
            calls: Mutex::new(Vec::new()),
        });
        gate_tx.send(()).unwrap();

        let (sensor, sensor_rx) = crate::input::SensorFeed::channel();
        sensor.publish(JointState::new(JointVector::from_element(3, 0.7)));
        let (request_tx, request_rx) = watch::channel(None);
        let (plans_tx, mut plans_rx) = watch::channel(initial_plan(3));
        let (settled_tx, _settled_rx) = watch::channel(0);
        let cancel = CancellationToken::new();

        let _handle = ReplanTrigger::new(
            planner.clone(),
            settings(),
            sensor_rx,
            request_rx,
            plans_tx,
            settled_tx,
            Arc::new(ReplanStats::default()),
        )
        .spawn(cancel.clone());

        request_tx.send_replace(Some(request(1, 1.0)));
        plans_rx.changed().await.unwrap();
        let plan = plans_rx.borrow().clone();
        assert_eq!(plan.trajectory.start(), &JointVector::from_element(3, 0.7));
        let calls = planner.calls.lock().unwrap();
        assert_eq!(calls[0].belief.as_ref().unwrap().len(), 3);
        assert_eq!(calls[0].horizon, 5.0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_plan() {
        let (_sensor, sensor_rx) = crate::input::SensorFeed::channel();
        let (request_tx, request_rx) = watch::channel(None);
        let (plans_tx, plans_rx) = watch::channel(initial_plan(3));
        let (settled_tx, settled_rx) = watch::channel(0);
        let stats = Arc::new(ReplanStats::default());
        let cancel = CancellationToken::new();

        let _handle = ReplanTrigger::new(
            Arc::new(FailingPlanner),
            settings(),
            sensor_rx,
            request_rx,
            plans_tx,
            settled_tx,
            stats.clone(),
        )
        .spawn(cancel.clone());

        request_tx.send_replace(Some(request(1, 1.0)));
        wait_for(|| stats.snapshot().failures == 1).await;
        assert_eq!(plans_rx.borrow().generation, 0);
        assert_eq!(stats.snapshot().installed, 0);
        wait_for(|| *settled_rx.borrow() == 1).await;

        // a later request is still planned
        request_tx.send_replace(Some(request(2, 2.0)));
        wait_for(|| stats.snapshot().failures == 2).await;
        assert_eq!(stats.snapshot().invocations, 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wrong_dof_is_rejected() {
        let (_sensor, sensor_rx) = crate::input::SensorFeed::channel();
        let (request_tx, request_rx) = watch::channel(None);
        let (plans_tx, plans_rx) = watch::channel(initial_plan(7));
        let (settled_tx, _settled_rx) = watch::channel(0);
        let stats = Arc::new(ReplanStats::default());
        let cancel = CancellationToken::new();

        // trigger expects 7 joints, request is for 3
        let _handle = ReplanTrigger::new(
            Arc::new(LinearPlanner::new(5)),
            settings(),
            sensor_rx,
            request_rx,
            plans_tx,
            settled_tx,
            stats.clone(),
        )
        .spawn(cancel.clone());

        request_tx.send_replace(Some(request(1, 1.0)));
        wait_for(|| stats.snapshot().failures == 1).await;
        assert_eq!(plans_rx.borrow().generation, 0);
        cancel.cancel();
    }
}
