//! Driver bindings used inside the worker process
//!
//! A driver performs the blocking hardware calls. Any of them may hang when
//! the physical link disappears; the worker cannot detect that itself, which is
//! why it runs in its own process under the supervisor's liveness timeout.
//!
//! 1. [`gamepad`] - gilrs-backed remote
//! 2. [`simulated`] - scripted remote for tests and demos

pub mod gamepad;
pub mod simulated;

use crate::device::StateSample;
use serde::{Deserialize, Serialize};

pub use gamepad::GamepadDriver;
pub use simulated::{Exhausted, SimulatedDriver, SimulationScript};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Failed to initialize driver: {0}")]
    InitializationError(String),

    #[error("No remote found: {0}")]
    NotFound(String),

    #[error("Remote disconnected: {0}")]
    Disconnected(String),

    #[error("Device error: {0}")]
    DeviceError(String),
}

/// Opaque hardware binding
pub trait RemoteDriver {
    type Handle;

    fn name(&self) -> &'static str;

    /// One connection attempt. Failure means "not found yet", not a fault.
    fn connect(&mut self) -> Result<Self::Handle, DriverError>;

    /// Reads the current state. May block indefinitely on a lost link.
    fn poll(&mut self, handle: &mut Self::Handle) -> Result<StateSample, DriverError>;

    fn release(&mut self, handle: Self::Handle);
}

/// Which driver the worker process should load
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Gamepad,
    Simulated,
}
