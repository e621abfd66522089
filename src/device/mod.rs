//! Device state shared between the supervisor and the render loop
//!
//! The supervisor is the only writer. The render loop reads a full copy once
//! per frame through a [`StateReader`]:
//!
//! ```text
//! Supervisor ──► PublishedState ──(watch)──► StateReader ──► render loop
//!   (writes)                                  (read() per frame)
//! ```

pub mod published;
pub mod state;

pub use published::{PublishedState, StateReader};
pub use state::{Acceleration, DeviceState, StateSample};
