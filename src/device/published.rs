//! Cross-thread publication of [`DeviceState`]
//!
//! Built on a `tokio::sync::watch` channel, the same way the controller output
//! is shared with the UI. A publish replaces the whole value under the channel's
//! lock, so a reader copying it out never sees fields from two different
//! updates, and always sees the most recent write.

use super::state::{DeviceState, StateSample};
use tokio::sync::watch;
use tracing::debug;

/// Write side, owned by the supervisor
#[derive(Debug)]
pub struct PublishedState {
    sender: watch::Sender<DeviceState>,
}

impl PublishedState {
    /// Creates the published state in its reset form
    pub fn new() -> Self {
        let (sender, _) = watch::channel(DeviceState::disconnected());
        Self { sender }
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn mark_connected(&self) {
        self.publish(DeviceState::connected());
    }

    pub fn apply_sample(&self, sample: &StateSample) {
        self.publish(DeviceState::live(sample));
    }

    pub fn reset(&self) {
        self.publish(DeviceState::disconnected());
    }

    fn publish(&self, state: DeviceState) {
        // send_replace keeps working when no reader is subscribed
        let previous = self.sender.send_replace(state);
        if previous.is_connected() != state.is_connected() {
            debug!("Published state changed: {} -> {}", previous, state);
        }
    }
}

impl Default for PublishedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side, handed to the render loop
///
/// `read()` copies the value out while holding the channel's read lock for the
/// duration of the copy only, so it never waits on the supervisor's schedule.
#[derive(Clone, Debug)]
pub struct StateReader {
    receiver: watch::Receiver<DeviceState>,
}

impl StateReader {
    pub fn read(&self) -> DeviceState {
        *self.receiver.borrow()
    }
}
