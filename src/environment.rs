//! Read-only environment context: named object centers and goal configurations.

use std::collections::BTreeMap;

use crate::joint::JointVector;

/// Named reference poses shared by the planner and the learner.
///
/// Object centers hold Cartesian coordinates; goal entries hold joint
/// configurations in radians and are keyed `GOAL<n> ANGLES`.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    object_centers: BTreeMap<String, Vec<f64>>,
    goals: Vec<JointVector>,
}

impl Environment {
    pub fn new(object_centers: BTreeMap<String, Vec<f64>>) -> Self {
        Self {
            object_centers,
            goals: Vec::new(),
        }
    }

    /// Register the next goal configuration and return its index.
    pub fn add_goal(&mut self, angles: JointVector) -> usize {
        let index = self.goals.len();
        self.object_centers
            .insert(goal_key(index), angles.as_slice().to_vec());
        self.goals.push(angles);
        index
    }

    /// Goal configurations in registration order.
    pub fn goals(&self) -> &[JointVector] {
        &self.goals
    }

    pub fn object(&self, name: &str) -> Option<&[f64]> {
        self.object_centers.get(name).map(|v| v.as_slice())
    }
}

fn goal_key(index: usize) -> String {
    format!("GOAL{} ANGLES", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goals_are_registered_as_objects() {
        let mut centers = BTreeMap::new();
        centers.insert("HUMAN_CENTER".to_string(), vec![-0.6, -0.55, 0.0]);
        let mut env = Environment::new(centers);

        let i0 = env.add_goal(JointVector::from_element(7, 1.0));
        let i1 = env.add_goal(JointVector::from_element(7, -1.0));
        assert_eq!((i0, i1), (0, 1));

        assert_eq!(env.goals().len(), 2);
        assert_eq!(env.goals()[1][0], -1.0);
        assert_eq!(env.object("GOAL0 ANGLES").unwrap().len(), 7);
        assert_eq!(env.object("HUMAN_CENTER").unwrap()[1], -0.55);
        assert!(env.object("TABLE").is_none());
    }
}
