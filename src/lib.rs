//! Kiosk front-end driven by a game-console remote
//!
//! The remote is read by a worker process so that a wedged or crashing driver
//! can never block the render loop. A supervisor thread owns that process,
//! restarts it whenever it faults or falls silent, and publishes the remote's
//! state for the render loop to read once per frame.
//!
//! ```text
//! Worker process ──stdout──► Supervisor thread ──► DeviceState ──► ScreenFlow
//! (driver calls)  (messages)  (liveness timeout)     (watch)        (per frame)
//! ```

pub mod config;
pub mod device;
pub mod driver;
pub mod protocol;
pub mod screens;
pub mod supervisor;
pub mod worker;

pub use config::KioskConfig;
pub use device::{DeviceState, StateReader};
pub use supervisor::{DeviceSupervisor, ProcessLauncher, SupervisorSettings};
