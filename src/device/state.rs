use serde::{Deserialize, Serialize};
use std::fmt;

/// Three-axis motion reading reported by the remote
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Acceleration {
    pub const ZERO: Acceleration = Acceleration {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Sum of absolute per-axis differences to `other`
    pub fn abs_delta(&self, other: &Acceleration) -> f64 {
        (self.x - other.x).abs() + (self.y - other.y).abs() + (self.z - other.z).abs()
    }
}

impl From<(f64, f64, f64)> for Acceleration {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Acceleration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// One reading taken from the driver by the worker
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSample {
    pub acceleration: Acceleration,
    pub button_a: bool,
    pub button_b: bool,
}

impl StateSample {
    pub fn new(acceleration: impl Into<Acceleration>, button_a: bool, button_b: bool) -> Self {
        Self {
            acceleration: acceleration.into(),
            button_a,
            button_b,
        }
    }

    /// Replaces NaN and infinite axes with 0.0, which JSON cannot carry
    pub fn with_finite_axes(mut self) -> Self {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        self.acceleration = Acceleration::new(
            finite(self.acceleration.x),
            finite(self.acceleration.y),
            finite(self.acceleration.z),
        );
        self
    }
}

/// Snapshot of the remote as seen by the render loop
///
/// Fields are private so the only way to build a disconnected value is
/// [`DeviceState::disconnected`], which is always neutral. A consumer can rely on
/// "not connected" meaning zero acceleration and no buttons held.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceState {
    connected: bool,
    acceleration: Acceleration,
    button_a: bool,
    button_b: bool,
}

impl DeviceState {
    /// The neutral, disconnected value
    pub const fn disconnected() -> Self {
        Self {
            connected: false,
            acceleration: Acceleration::ZERO,
            button_a: false,
            button_b: false,
        }
    }

    /// Connected, with no reading received yet
    pub const fn connected() -> Self {
        Self {
            connected: true,
            acceleration: Acceleration::ZERO,
            button_a: false,
            button_b: false,
        }
    }

    /// Connected, carrying every field of `sample`
    pub fn live(sample: &StateSample) -> Self {
        Self {
            connected: true,
            acceleration: sample.acceleration,
            button_a: sample.button_a,
            button_b: sample.button_b,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::disconnected();
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn acceleration(&self) -> Acceleration {
        self.acceleration
    }

    pub fn button_a(&self) -> bool {
        self.button_a
    }

    pub fn button_b(&self) -> bool {
        self.button_b
    }

    /// True when motion and buttons hold their reset values
    pub fn is_neutral(&self) -> bool {
        self.acceleration == Acceleration::ZERO && !self.button_a && !self.button_b
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.connected {
            return write!(f, "disconnected");
        }
        write!(
            f,
            "connected acc={} A:{} B:{}",
            self.acceleration, self.button_a, self.button_b
        )
    }
}
