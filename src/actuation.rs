//! Actuation collaborator contract.

use std::ops::{Deref, DerefMut};

/// Sink for velocity commands and the compliant-mode switch.
///
/// Commands are joint velocities in degrees per second.
pub trait Actuator: Send {
    fn publish_velocity(&mut self, deg_per_s: &[f64]) -> anyhow::Result<()>;

    /// Enter admittance (compliant) mode so a human can push the arm.
    fn start_admittance(&mut self) -> anyhow::Result<()>;

    fn stop_admittance(&mut self) -> anyhow::Result<()>;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn publish_velocity(&mut self, deg_per_s: &[f64]) -> anyhow::Result<()> {
        (**self).publish_velocity(deg_per_s)
    }

    fn start_admittance(&mut self) -> anyhow::Result<()> {
        (**self).start_admittance()
    }

    fn stop_admittance(&mut self) -> anyhow::Result<()> {
        (**self).stop_admittance()
    }
}

/// Holds the actuator in admittance mode and leaves it on drop.
///
/// Dropping the guard covers every exit path of the control loop, including
/// unwinding and the enclosing future being dropped.
pub struct AdmittanceGuard<'a, A: Actuator + ?Sized> {
    actuator: &'a mut A,
    engaged: bool,
}

impl<'a, A: Actuator + ?Sized> AdmittanceGuard<'a, A> {
    pub fn engage(actuator: &'a mut A) -> anyhow::Result<Self> {
        actuator.start_admittance()?;
        tracing::info!("Admittance mode enabled");
        Ok(Self {
            actuator,
            engaged: true,
        })
    }

    /// Leave admittance mode now, reporting the error instead of logging it.
    pub fn release(mut self) -> anyhow::Result<()> {
        self.engaged = false;
        let result = self.actuator.stop_admittance();
        if result.is_ok() {
            tracing::info!("Admittance mode disabled");
        }
        result
    }
}

impl<A: Actuator + ?Sized> Deref for AdmittanceGuard<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.actuator
    }
}

impl<A: Actuator + ?Sized> DerefMut for AdmittanceGuard<'_, A> {
    fn deref_mut(&mut self) -> &mut A {
        self.actuator
    }
}

impl<A: Actuator + ?Sized> Drop for AdmittanceGuard<'_, A> {
    fn drop(&mut self) {
        if !self.engaged {
            return;
        }
        match self.actuator.stop_admittance() {
            Ok(()) => tracing::info!("Admittance mode disabled"),
            Err(e) => tracing::error!("Failed to leave admittance mode: {}", e),
        }
    }
}
