//! Property-based tests for controller and belief invariants.
//!
//! Run with: cargo test --test properties

use std::sync::Arc;

use proptest::prelude::*;
use teleop_inference::detector::CorrectionSource;
use teleop_inference::environment::Environment;
use teleop_inference::learner::{Hypothesis, LearnerContext};
use teleop_inference::{
    Belief, BoltzmannGoalModel, ControlGains, CorrectionEvent, JointState, JointVector, Learner,
    PidController, ReplanPolicy, Trajectory,
};

const DOF: usize = 3;

fn arb_joints() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-10.0..10.0f64, DOF)
}

fn ramp(goal: &[f64]) -> Arc<Trajectory> {
    let waypts = (0..=10)
        .map(|k| JointVector::from_iterator(DOF, goal.iter().map(|g| g * k as f64 / 10.0)))
        .collect();
    let times = (0..=10).map(|k| k as f64 * 0.5).collect();
    Arc::new(Trajectory::new(waypts, times).unwrap())
}

fn context(goals: &[Vec<f64>], betas: Vec<f64>) -> Arc<LearnerContext> {
    let mut env = Environment::default();
    let hypotheses = goals
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let goal = JointVector::from_vec(g.clone());
            env.add_goal(goal.clone());
            Hypothesis {
                goal_index: i,
                goal,
                weights: vec![1.0],
            }
        })
        .collect();
    Arc::new(LearnerContext {
        hypotheses,
        feat_list: vec!["efficiency".into()],
        betas,
        environment: Arc::new(env),
    })
}

proptest! {
    #[test]
    fn proptest_commands_stay_within_limits(
        gains in (0.0..100.0f64, 0.0..10.0f64, 0.0..10.0f64),
        max_cmd in 0.01..5.0f64,
        goal in arb_joints(),
        positions in prop::collection::vec(arb_joints(), 1..40),
    ) {
        let (p, i, d) = gains;
        let mut controller = PidController::new(ControlGains::uniform(DOF, p, i, d, 0.1, max_cmd));
        controller.set_trajectory(ramp(&goal)).unwrap();

        for (k, pos) in positions.iter().enumerate() {
            let cmd = controller
                .get_command(&JointVector::from_vec(pos.clone()), k as f64 * 0.01)
                .unwrap();
            for c in cmd.iter() {
                prop_assert!(c.is_finite());
                prop_assert!(c.abs() <= max_cmd);
            }
        }
    }

    #[test]
    fn proptest_belief_stays_a_distribution(
        goals in prop::collection::vec(arb_joints(), 2..5),
        prior_weights in prop::collection::vec(0.01..1.0f64, 5),
        betas in prop::collection::vec(0.01..50.0f64, 1..4),
        corrections in prop::collection::vec((arb_joints(), arb_joints()), 1..20),
    ) {
        let n = goals.len();
        let prior = Belief::new(prior_weights[..n].to_vec()).unwrap();
        let mut learner = Learner::new(
            context(&goals, betas),
            Box::new(BoltzmannGoalModel),
            prior,
            ReplanPolicy::default(),
        )
        .unwrap();

        for (deviation, position) in corrections {
            let event = CorrectionEvent {
                deviation: JointVector::from_vec(deviation),
                source: CorrectionSource::Motion,
                state: JointState::new(JointVector::from_vec(position)),
            };
            if let Some(request) = learner.update(&event) {
                prop_assert!(request.hypothesis < n);
                prop_assert!(request.belief.is_valid());
            }
            let belief = learner.belief();
            prop_assert_eq!(belief.len(), n);
            prop_assert!(belief.is_valid());
        }
    }

    #[test]
    fn proptest_start_detected_at_most_once(
        positions in prop::collection::vec(prop::collection::vec(-0.3..0.3f64, DOF), 1..60),
    ) {
        let gains = ControlGains::uniform(DOF, 1.0, 0.0, 0.0, 0.1, 1.0);
        let mut controller = PidController::new(gains);
        controller.set_trajectory(ramp(&[1.0, 1.0, 1.0])).unwrap();

        let mut first = None;
        for (k, pos) in positions.iter().enumerate() {
            controller
                .get_command(&JointVector::from_vec(pos.clone()), k as f64 * 0.01)
                .unwrap();
            match (first, controller.path_start_t()) {
                (None, Some(t)) => first = Some(t),
                (Some(t0), t) => prop_assert_eq!(Some(t0), t),
                (None, None) => {}
            }
        }
    }
}
