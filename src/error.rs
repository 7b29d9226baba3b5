//! Error types for the tracking and correction loop.

use thiserror::Error;

/// Errors raised by the controller, planner and coordination layers.
///
/// Startup errors (`Configuration`, `PlanningFailed` during the initial plan) are
/// fatal. Everything raised once the loop is running is isolated to a single
/// cycle or a single background task.
#[derive(Debug, Error)]
pub enum TeleopError {
    /// Missing or invalid parameter, or an unsupported planner/controller type.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sensed state and active trajectory disagree on joint count.
    #[error("dimension mismatch: expected {expected} joints, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The controller was asked for a command before a trajectory was set.
    #[error("no active trajectory")]
    NoActiveTrajectory,

    /// A trajectory violated its construction invariants.
    #[error("invalid trajectory: {0}")]
    InvalidTrajectory(String),

    /// The planner could not produce a trajectory.
    #[error("planning failed: {0}")]
    PlanningFailed(String),

    /// A runtime replan failed; the previous trajectory stays active.
    #[error("replan failed: {0}")]
    ReplanFailed(String),
}

impl TeleopError {
    /// Create a Configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an InvalidTrajectory error with a message.
    pub fn invalid_trajectory(msg: impl Into<String>) -> Self {
        Self::InvalidTrajectory(msg.into())
    }

    /// Create a PlanningFailed error with a message.
    pub fn planning(msg: impl Into<String>) -> Self {
        Self::PlanningFailed(msg.into())
    }

    /// Whether the loop can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. } | Self::ReplanFailed(_) | Self::NoActiveTrajectory
        )
    }
}

pub type Result<T> = std::result::Result<T, TeleopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = TeleopError::DimensionMismatch {
            expected: 7,
            actual: 6,
        };
        assert_eq!(err.to_string(), "dimension mismatch: expected 7 joints, got 6");
        assert_eq!(
            TeleopError::config("Planner foo not implemented.").to_string(),
            "configuration error: Planner foo not implemented."
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(TeleopError::ReplanFailed("x".into()).is_recoverable());
        assert!(TeleopError::DimensionMismatch {
            expected: 7,
            actual: 3
        }
        .is_recoverable());
        assert!(!TeleopError::config("bad").is_recoverable());
        assert!(!TeleopError::planning("no solution").is_recoverable());
    }
}
