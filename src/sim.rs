//! Simulated arm: a kinematic stand-in for the arm driver.
//!
//! Each published velocity command is integrated over one control period and
//! the new configuration goes out on the sensor feed, so the loop sees its own
//! commands come back as readings. Readings are stamped with the arm's own
//! clock, which advances by one period per command. Pushes emulate a human
//! moving the arm and only take effect while admittance mode is on.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::actuation::Actuator;
use crate::input::SensorFeed;
use crate::joint::{self, JointState, JointVector, DEG_TO_RAD};

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Integration step (s); normally the control period.
    pub dt: f64,
    /// Uniform position noise amplitude (deg). Zero disables noise.
    pub noise_deg: f64,
    /// Torque reported per radian of push.
    pub push_stiffness: f64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            noise_deg: 0.0,
            push_stiffness: 10.0,
            seed: 7,
        }
    }
}

#[derive(Debug)]
struct ArmState {
    position: JointVector,
    admittance: bool,
    pending_push: Option<JointVector>,
    commands: u64,
    max_abs_command: f64,
    failures_left: u32,
    clock: Instant,
}

fn lock(state: &Mutex<ArmState>) -> MutexGuard<'_, ArmState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SimulatedArm {
    state: Arc<Mutex<ArmState>>,
    sensor: SensorFeed,
    config: SimConfig,
    rng: StdRng,
}

/// Test and operator access to a running [`SimulatedArm`].
#[derive(Clone)]
pub struct SimArmHandle {
    state: Arc<Mutex<ArmState>>,
}

impl SimulatedArm {
    /// Create an arm resting at `initial` (rad) and publish the first reading.
    pub fn new(
        initial: JointVector,
        sensor: SensorFeed,
        config: SimConfig,
    ) -> (Self, SimArmHandle) {
        let state = Arc::new(Mutex::new(ArmState {
            position: initial,
            admittance: false,
            pending_push: None,
            commands: 0,
            max_abs_command: 0.0,
            failures_left: 0,
            clock: Instant::now(),
        }));
        let mut arm = Self {
            state: state.clone(),
            sensor,
            rng: StdRng::seed_from_u64(config.seed),
            config,
        };
        let (position, clock) = {
            let state = lock(&arm.state);
            (state.position.clone(), state.clock)
        };
        arm.publish_reading(position, None, clock);
        (arm, SimArmHandle { state })
    }

    fn publish_reading(
        &mut self,
        position: JointVector,
        push: Option<&JointVector>,
        at: Instant,
    ) {
        let noise = self.config.noise_deg * DEG_TO_RAD;
        let sensed = if noise > 0.0 {
            position.map(|p| p + self.rng.random_range(-noise..=noise))
        } else {
            position
        };
        let dof = sensed.len();
        let torque = match push {
            Some(p) => p * self.config.push_stiffness,
            None => JointVector::zeros(dof),
        };
        self.sensor.publish(
            JointState::new(sensed)
                .with_torque(torque)
                .received_at(at),
        );
    }
}

impl Actuator for SimulatedArm {
    fn publish_velocity(&mut self, deg_per_s: &[f64]) -> anyhow::Result<()> {
        let (position, push, clock) = {
            let mut state = lock(&self.state);
            if state.failures_left > 0 {
                state.failures_left -= 1;
                anyhow::bail!("simulated transport failure");
            }
            if deg_per_s.len() != state.position.len() {
                anyhow::bail!(
                    "command has {} joints, arm has {}",
                    deg_per_s.len(),
                    state.position.len()
                );
            }
            let velocity = joint::from_degrees(deg_per_s);
            state.commands += 1;
            state.max_abs_command = state.max_abs_command.max(velocity.amax());
            state.position += velocity * self.config.dt;
            state.clock += Duration::from_secs_f64(self.config.dt);

            let push = state.pending_push.take();
            if let Some(ref p) = push {
                state.position += p;
            }
            (state.position.clone(), push, state.clock)
        };
        self.publish_reading(position, push.as_ref(), clock);
        Ok(())
    }

    fn start_admittance(&mut self) -> anyhow::Result<()> {
        lock(&self.state).admittance = true;
        tracing::debug!("Simulated arm compliant");
        Ok(())
    }

    fn stop_admittance(&mut self) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.admittance = false;
        state.pending_push = None;
        tracing::debug!("Simulated arm stiff");
        Ok(())
    }
}

impl SimArmHandle {
    pub fn position(&self) -> JointVector {
        lock(&self.state).position.clone()
    }

    pub fn admittance_enabled(&self) -> bool {
        lock(&self.state).admittance
    }

    /// Displace the arm by `delta` (rad) on the next command. Ignored unless
    /// the arm is compliant. Returns whether the push was accepted.
    pub fn push(&self, delta: JointVector) -> bool {
        let mut state = lock(&self.state);
        if !state.admittance {
            tracing::warn!("Push ignored: arm is not in admittance mode");
            return false;
        }
        if delta.len() != state.position.len() {
            tracing::warn!(
                "Push ignored: {} joints for a {}-joint arm",
                delta.len(),
                state.position.len()
            );
            return false;
        }
        state.pending_push = Some(match state.pending_push.take() {
            Some(p) => p + delta,
            None => delta,
        });
        true
    }

    pub fn commands_published(&self) -> u64 {
        lock(&self.state).commands
    }

    /// Largest absolute joint command seen so far (rad/s).
    pub fn max_abs_command(&self) -> f64 {
        lock(&self.state).max_abs_command
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        lock(&self.state).failures_left = n;
    }
}
