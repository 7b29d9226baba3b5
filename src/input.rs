//! Single-slot input feeds from the sensing and operator collaborators.
//!
//! Both feeds are `tokio::sync::watch` slots: a producer overwrites the latest
//! value and the control loop reads whatever is newest at the start of a cycle.
//! A burst of readings never builds a backlog.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::joint::{JointState, JointVector};

/// Producer side of the joint-state slot.
#[derive(Clone)]
pub struct SensorFeed {
    tx: Arc<watch::Sender<Option<JointState>>>,
}

impl SensorFeed {
    /// Create a new empty feed and its first reader.
    pub fn channel() -> (Self, watch::Receiver<Option<JointState>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Publish a reading already expressed in radians. Readings without a
    /// timestamp are stamped with the current instant.
    pub fn publish(&self, mut state: JointState) {
        if state.received.is_none() {
            state.received = Some(Instant::now());
        }
        self.tx.send_replace(Some(state));
    }

    /// Publish raw sensor values (degrees, torques in sensor units).
    pub fn publish_degrees(&self, angles: &[f64], torques: Option<&[f64]>) {
        self.publish(JointState::from_degrees(angles, torques));
    }

    /// The most recent reading, if any arrived yet.
    pub fn latest(&self) -> Option<JointState> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JointState>> {
        self.tx.subscribe()
    }
}

/// Producer side of the operator device slot (joystick axes or key bindings
/// mapped to a joint-space direction).
#[derive(Clone)]
pub struct DeviceFeed {
    tx: Arc<watch::Sender<Option<JointVector>>>,
}

impl DeviceFeed {
    pub fn channel() -> (Self, watch::Receiver<Option<JointVector>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Set the current device signal. It stays active until cleared.
    pub fn set(&self, axes: JointVector) {
        self.tx.send_replace(Some(axes));
    }

    /// Release the device (no input).
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JointVector>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_feed_keeps_latest_only() {
        let (feed, mut rx) = SensorFeed::channel();
        assert!(rx.borrow().is_none());

        feed.publish_degrees(&[10.0; 7], None);
        feed.publish_degrees(&[20.0; 7], None);
        feed.publish_degrees(&[30.0; 7], None);

        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone().unwrap();
        assert!((state.position[0] - 30.0_f64.to_radians()).abs() < 1e-12);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_readings_are_stamped_once() {
        let (feed, _rx) = SensorFeed::channel();
        feed.publish(JointState::new(JointVector::zeros(2)));
        assert!(feed.latest().unwrap().received.is_some());

        let at = Instant::now() + std::time::Duration::from_secs(3);
        feed.publish(JointState::new(JointVector::zeros(2)).received_at(at));
        assert_eq!(feed.latest().unwrap().received, Some(at));
    }

    #[test]
    fn test_device_feed_set_and_clear() {
        let (feed, rx) = DeviceFeed::channel();
        feed.set(JointVector::from_element(7, 1.0));
        assert_eq!(rx.borrow().as_ref().unwrap().len(), 7);
        feed.clear();
        assert!(rx.borrow().is_none());
    }
}
