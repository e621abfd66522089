//! gilrs-backed remote
//!
//! The remote is read as a gamepad. South and East are the A and B buttons.
//! The motion triple is taken from the left stick X/Y and the left trigger,
//! each passed through the deadzone before it is reported.

use super::{DriverError, RemoteDriver};
use crate::device::{Acceleration, StateSample};
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use tracing::{debug, error, info, warn};

const DEFAULT_DEADZONE: f32 = 0.05;

pub struct GamepadDriver {
    gilrs: Gilrs,
    deadzone: f32,
}

#[derive(Debug)]
pub struct GamepadHandle {
    id: GamepadId,
}

impl GamepadDriver {
    pub fn new() -> Result<Self, DriverError> {
        let gilrs = Gilrs::new().map_err(|e| {
            error!("gilrs unavailable, cannot read the remote: {}", e);
            DriverError::InitializationError(e.to_string())
        })?;
        info!("gilrs ready, {} gamepad(s) visible", gilrs.gamepads().count());
        Ok(Self {
            gilrs,
            deadzone: DEFAULT_DEADZONE,
        })
    }

    pub fn with_deadzone(mut self, deadzone: f32) -> Self {
        self.deadzone = deadzone;
        self
    }

    /// Drains pending gilrs events. Returns true if `watched` disconnected.
    fn pump_events(&mut self, watched: Option<GamepadId>) -> bool {
        let mut lost = false;
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            match event {
                EventType::Disconnected if Some(id) == watched => {
                    warn!("Gamepad {} disconnected", id);
                    lost = true;
                }
                EventType::Connected => debug!("Gamepad {} connected", id),
                _ => {}
            }
        }
        lost
    }
}

impl RemoteDriver for GamepadDriver {
    type Handle = GamepadHandle;

    fn name(&self) -> &'static str {
        "gamepad"
    }

    fn connect(&mut self) -> Result<GamepadHandle, DriverError> {
        self.pump_events(None);

        let Some((id, gamepad)) = self.gilrs.gamepads().next() else {
            return Err(DriverError::NotFound("no gamepad connected".to_string()));
        };
        info!("Selected gamepad: {} ({})", gamepad.name(), id);
        Ok(GamepadHandle { id })
    }

    fn poll(&mut self, handle: &mut GamepadHandle) -> Result<StateSample, DriverError> {
        if self.pump_events(Some(handle.id)) {
            return Err(DriverError::Disconnected(format!(
                "gamepad {} went away",
                handle.id
            )));
        }

        let Some(gamepad) = self.gilrs.connected_gamepad(handle.id) else {
            return Err(DriverError::Disconnected(format!(
                "gamepad {} is no longer connected",
                handle.id
            )));
        };

        let axis = |a: Axis| f64::from(apply_deadzone(gamepad.value(a), self.deadzone));
        Ok(StateSample {
            acceleration: Acceleration::new(
                axis(Axis::LeftStickX),
                axis(Axis::LeftStickY),
                axis(Axis::LeftZ),
            ),
            button_a: gamepad.is_pressed(Button::South),
            button_b: gamepad.is_pressed(Button::East),
        })
    }

    fn release(&mut self, handle: GamepadHandle) {
        debug!("Releasing gamepad {}", handle.id);
    }
}

// Rescales values outside the deadzone back to the full range. Never NaN.
fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    let magnitude = value.abs();
    if !magnitude.is_finite() || magnitude < deadzone {
        return 0.0;
    }
    let span = 1.0 - deadzone;
    if span <= f32::EPSILON {
        return value.signum();
    }
    value.signum() * ((magnitude - deadzone) / span).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::apply_deadzone;

    #[test]
    fn deadzone_zeroes_small_values() {
        assert_eq!(apply_deadzone(0.04, 0.05), 0.0);
        assert_eq!(apply_deadzone(-0.04, 0.05), 0.0);
    }

    #[test]
    fn deadzone_rescales_to_full_range() {
        assert!((apply_deadzone(1.0, 0.05) - 1.0).abs() < 1e-6);
        assert!((apply_deadzone(-1.0, 0.05) + 1.0).abs() < 1e-6);
        assert!(apply_deadzone(0.5, 0.05) < 0.5);
    }

    #[test]
    fn full_deadzone_and_bad_input_stay_finite() {
        assert_eq!(apply_deadzone(1.0, 1.0), 1.0);
        assert_eq!(apply_deadzone(-1.0, 1.0), -1.0);
        assert_eq!(apply_deadzone(0.5, 1.0), 0.0);
        assert_eq!(apply_deadzone(f32::NAN, 0.05), 0.0);
        assert_eq!(apply_deadzone(f32::INFINITY, 0.05), 0.0);
    }
}
