//! Online belief over the operator's objective.
//!
//! The [`Learner`] keeps a [`Belief`] over a fixed list of (goal, weights)
//! hypotheses and folds detected corrections into it through a pluggable
//! [`BeliefModel`]. When the belief moves far enough from the one the active
//! plan was made under, it emits a [`ReplanRequest`]. The active plan only
//! changes once the control loop has a new one to install, so a failed replan
//! leaves the learner free to ask again on the next correction.
//!
//! [`LearnerTask`] runs the learner off the control task. Updates execute on
//! the blocking pool so a slow model never delays command publication.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::detector::CorrectionEvent;
use crate::environment::Environment;
use crate::error::{Result, TeleopError};
use crate::joint::JointVector;
use crate::replan::{InstalledPlan, ReplanRequest};

/// Sum-to-one tolerance for a valid distribution.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// Probability distribution over hypotheses.
#[derive(Clone, Debug, PartialEq)]
pub struct Belief {
    probs: Vec<f64>,
}

impl Belief {
    /// Build a belief from non-negative weights, normalizing them.
    pub fn new(weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(TeleopError::config("belief needs at least one hypothesis"));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TeleopError::config(format!(
                "belief weights must be finite and non-negative: {:?}",
                weights
            )));
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(TeleopError::config("belief weights sum to zero"));
        }
        Ok(Self {
            probs: weights.into_iter().map(|w| w / total).collect(),
        })
    }

    pub fn uniform(n: usize) -> Result<Self> {
        Self::new(vec![1.0; n])
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probs
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Most likely hypothesis and its probability. Ties go to the lowest index.
    pub fn map(&self) -> (usize, f64) {
        let mut best = (0, self.probs[0]);
        for (i, p) in self.probs.iter().enumerate().skip(1) {
            if *p > best.1 {
                best = (i, *p);
            }
        }
        best
    }

    /// Total variation distance to another belief over the same hypotheses.
    pub fn total_variation(&self, other: &Belief) -> f64 {
        0.5 * self
            .probs
            .iter()
            .zip(other.probs.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
    }

    /// Bayesian update. Returns `None` when the likelihoods cannot be
    /// normalized (wrong length, all zero, or non-finite).
    pub fn posterior(&self, likelihoods: &[f64]) -> Option<Belief> {
        if likelihoods.len() != self.probs.len() {
            return None;
        }
        let unnormalized: Vec<f64> = self
            .probs
            .iter()
            .zip(likelihoods)
            .map(|(p, l)| if l.is_finite() && *l > 0.0 { p * l } else { 0.0 })
            .collect();
        let total: f64 = unnormalized.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return None;
        }
        Some(Belief {
            probs: unnormalized.into_iter().map(|p| p / total).collect(),
        })
    }

    /// Non-negative and summing to one within [`PROBABILITY_TOLERANCE`].
    pub fn is_valid(&self) -> bool {
        let total: f64 = self.probs.iter().sum();
        self.probs.iter().all(|p| p.is_finite() && *p >= 0.0)
            && (total - 1.0).abs() <= PROBABILITY_TOLERANCE
    }
}

/// One candidate operator objective.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    pub goal_index: usize,
    pub goal: JointVector,
    pub weights: Vec<f64>,
}

/// Read-only inputs to a belief update.
#[derive(Clone, Debug)]
pub struct LearnerContext {
    pub hypotheses: Vec<Hypothesis>,
    pub feat_list: Vec<String>,
    /// Rationality parameters.
    pub betas: Vec<f64>,
    pub environment: Arc<Environment>,
}

/// Observation model for corrections.
pub trait BeliefModel: Send + Sync {
    /// Likelihood of `event` under each hypothesis, in hypothesis order.
    fn likelihoods(&self, event: &CorrectionEvent, context: &LearnerContext) -> Vec<f64>;
}

/// Boltzmann-rational goal inference.
///
/// A correction is scored against each goal by the cosine between its direction
/// and the joint-space direction from the current configuration to that goal.
/// Each rationality parameter β gives a softmax over hypotheses; the likelihood
/// averages over all β.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoltzmannGoalModel;

impl BoltzmannGoalModel {
    fn score(direction: &JointVector, position: &JointVector, goal: &JointVector) -> f64 {
        if goal.len() != position.len() {
            return 0.0;
        }
        let to_goal = goal - position;
        let norm = to_goal.norm();
        if norm < 1e-9 {
            0.0
        } else {
            direction.dot(&to_goal) / norm
        }
    }
}

impl BeliefModel for BoltzmannGoalModel {
    fn likelihoods(&self, event: &CorrectionEvent, context: &LearnerContext) -> Vec<f64> {
        let n = context.hypotheses.len();
        let Some(direction) = event.direction() else {
            return vec![1.0; n];
        };
        if direction.len() != event.state.position.len() {
            return vec![1.0; n];
        }
        let scores: Vec<f64> = context
            .hypotheses
            .iter()
            .map(|h| Self::score(&direction, &event.state.position, &h.goal))
            .collect();

        let mut likelihoods = vec![0.0; n];
        for beta in &context.betas {
            // scores are in [-1, 1], subtract the max for numerical stability
            let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = scores.iter().map(|s| (beta * (s - max)).exp()).collect();
            let z: f64 = exps.iter().sum();
            for (l, e) in likelihoods.iter_mut().zip(exps) {
                *l += e / z;
            }
        }
        let count = context.betas.len().max(1) as f64;
        likelihoods.iter_mut().for_each(|l| *l /= count);
        likelihoods
    }
}

/// When a belief change is significant enough to replan.
#[derive(Clone, Copy, Debug)]
pub struct ReplanPolicy {
    /// Minimum probability of a new MAP hypothesis.
    pub confidence: f64,
    /// Minimum total variation distance from the belief of the active plan.
    pub min_shift: f64,
}

impl Default for ReplanPolicy {
    fn default() -> Self {
        Self {
            confidence: 0.6,
            min_shift: 0.3,
        }
    }
}

/// Owns the belief and decides on replans.
pub struct Learner {
    context: Arc<LearnerContext>,
    model: Box<dyn BeliefModel>,
    policy: ReplanPolicy,
    belief: Belief,
    planned_hypothesis: usize,
    planned_belief: Belief,
    /// Sequence number and hypothesis of the request awaiting an outcome.
    pending: Option<(u64, usize)>,
    next_seq: u64,
    updates: u64,
}

impl Learner {
    /// The prior's MAP hypothesis is taken as the one the initial plan targets.
    pub fn new(
        context: Arc<LearnerContext>,
        model: Box<dyn BeliefModel>,
        prior: Belief,
        policy: ReplanPolicy,
    ) -> Result<Self> {
        if prior.len() != context.hypotheses.len() {
            return Err(TeleopError::config(format!(
                "prior has {} entries but there are {} hypotheses",
                prior.len(),
                context.hypotheses.len()
            )));
        }
        let (planned_hypothesis, _) = prior.map();
        Ok(Self {
            context,
            model,
            policy,
            planned_belief: prior.clone(),
            belief: prior,
            planned_hypothesis,
            pending: None,
            next_seq: 1,
            updates: 0,
        })
    }

    pub fn belief(&self) -> &Belief {
        &self.belief
    }

    pub fn context(&self) -> &LearnerContext {
        &self.context
    }

    /// Hypothesis the active plan was made for.
    pub fn planned_hypothesis(&self) -> usize {
        self.planned_hypothesis
    }

    /// Hypothesis of the replan request still waiting for an outcome.
    pub fn pending_hypothesis(&self) -> Option<usize> {
        self.pending.map(|(_, h)| h)
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Adopt a plan the control loop is about to track.
    pub fn plan_installed(&mut self, plan: &InstalledPlan) {
        if let Some(h) = plan.hypothesis.filter(|h| *h < self.belief.len()) {
            self.planned_hypothesis = h;
        }
        if plan.belief.len() == self.belief.len() {
            self.planned_belief = (*plan.belief).clone();
        }
    }

    /// The replan worker is done with every request up to `seq`, whether it
    /// installed, discarded or failed it.
    pub fn request_settled(&mut self, seq: u64) {
        if matches!(self.pending, Some((pending, _)) if pending <= seq) {
            self.pending = None;
        }
    }

    /// Fold one correction into the belief.
    pub fn update(&mut self, event: &CorrectionEvent) -> Option<ReplanRequest> {
        let likelihoods = self.model.likelihoods(event, &self.context);
        let Some(posterior) = self.belief.posterior(&likelihoods) else {
            tracing::warn!(
                "Belief update skipped: degenerate likelihoods {:?}",
                likelihoods
            );
            return None;
        };
        self.belief = posterior;
        self.updates += 1;

        let (map, p) = self.belief.map();
        let switched = map != self.planned_hypothesis && p >= self.policy.confidence;
        let shift = self.belief.total_variation(&self.planned_belief);
        if !(switched || shift >= self.policy.min_shift) {
            return None;
        }
        if self.pending_hypothesis() == Some(map) {
            return None;
        }

        tracing::info!(
            "Belief shift {:.3}: replanning for hypothesis {} (p={:.3})",
            shift,
            map,
            p
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending = Some((seq, map));
        let hypothesis = &self.context.hypotheses[map];
        Some(ReplanRequest {
            seq,
            hypothesis: map,
            goal: hypothesis.goal.clone(),
            weights: hypothesis.weights.clone(),
            belief: Arc::new(self.belief.clone()),
            state: event.state.clone(),
        })
    }
}

/// What the replan worker reports back to the learner: the plan the loop
/// will install and the last request it finished with.
pub struct ReplanFeedback {
    plans: watch::Receiver<InstalledPlan>,
    settled: watch::Receiver<u64>,
    plans_open: bool,
    settled_open: bool,
}

impl ReplanFeedback {
    pub fn new(plans: watch::Receiver<InstalledPlan>, settled: watch::Receiver<u64>) -> Self {
        Self {
            plans,
            settled,
            plans_open: true,
            settled_open: true,
        }
    }

    /// Wait until either channel has news. Pends forever once both are closed.
    async fn changed(&mut self) {
        loop {
            tokio::select! {
                changed = self.plans.changed(), if self.plans_open => match changed {
                    Ok(()) => return,
                    Err(_) => self.plans_open = false,
                },
                changed = self.settled.changed(), if self.settled_open => match changed {
                    Ok(()) => return,
                    Err(_) => self.settled_open = false,
                },
                else => std::future::pending::<()>().await,
            }
        }
    }

    /// Bring the learner up to date with the latest plan and outcome.
    fn apply(&mut self, learner: &mut Learner) {
        let plan = self.plans.borrow_and_update().clone();
        learner.plan_installed(&plan);
        let seq = *self.settled.borrow_and_update();
        learner.request_settled(seq);
    }
}

/// Background task applying corrections to the learner.
pub struct LearnerTask;

impl LearnerTask {
    /// Spawn the task. It stops when `cancel` fires or the event channel closes,
    /// and hands the learner back through the join handle.
    ///
    /// Events queued while an update runs are applied together in the next
    /// batch, in arrival order. `feedback` tells the learner what the replan
    /// worker did with earlier requests.
    pub fn spawn(
        learner: Learner,
        mut events: mpsc::UnboundedReceiver<CorrectionEvent>,
        mut feedback: ReplanFeedback,
        belief_tx: watch::Sender<Arc<Belief>>,
        replan_tx: watch::Sender<Option<ReplanRequest>>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<Learner>> {
        tokio::spawn(async move {
            let mut learner = learner;
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = feedback.changed() => {
                        feedback.apply(&mut learner);
                        continue;
                    }
                    event = events.recv() => match event {
                        Some(e) => e,
                        None => break,
                    },
                };
                feedback.apply(&mut learner);
                let before = learner.updates();
                let mut batch = vec![first];
                while let Ok(e) = events.try_recv() {
                    batch.push(e);
                }
                if batch.len() > 1 {
                    tracing::debug!("Coalescing {} corrections into one update", batch.len());
                }

                let work = tokio::task::spawn_blocking(move || {
                    let mut request = None;
                    for event in &batch {
                        if let Some(r) = learner.update(event) {
                            request = Some(r);
                        }
                    }
                    (learner, request)
                });

                let (returned, request) = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Learner cancelled with an update in flight");
                        return None;
                    }
                    joined = work => match joined {
                        Ok(out) => out,
                        Err(e) => {
                            tracing::error!("Learner update panicked: {}", e);
                            return None;
                        }
                    },
                };
                learner = returned;

                if learner.updates() > before {
                    belief_tx.send_replace(Arc::new(learner.belief().clone()));
                }
                if let Some(request) = request {
                    replan_tx.send_replace(Some(request));
                }
            }
            Some(learner)
        })
    }
}
