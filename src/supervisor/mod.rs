//! Device supervisor
//!
//! Owns the worker process and keeps the published [`DeviceState`] consistent
//! with what the worker last reported:
//!
//! 1. [`launcher`] - spawning and terminating worker processes
//! 2. [`machine`] - the AwaitingConnection / ConnectedLive / Restarting state machine
//! 3. [`DeviceSupervisor`] - start/stop handle and the render loop's read access
//!
//! ```text
//! Worker ──Channel──► Supervisor thread ──► PublishedState ──► render loop
//! (process)           (current-thread rt)     (watch)          read() per frame
//! ```
//!
//! Every worker-side failure is recovered by restarting the worker. The only
//! thing the render loop ever notices is `connected` going false.

pub mod launcher;
pub mod machine;

use crate::device::{DeviceState, PublishedState, StateReader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use launcher::{
    LaunchError, ProcessLauncher, SpawnedWorker, Termination, WorkerId, WorkerLauncher,
    WorkerProcess,
};
pub use machine::RestartCause;

use machine::{AwaitingConnection, DeviceMachine, Phase};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Silence longer than this while connected means the worker hung
    pub liveness_timeout_ms: u64,
    /// Time a worker gets to exit on its own before it is killed
    pub shutdown_grace_ms: u64,
    /// Bound of the worker message channel
    pub channel_capacity: usize,
    /// Pause before replacing a failed worker
    pub respawn_delay_ms: u64,
    pub stats_interval_s: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 1000,
            shutdown_grace_ms: 300,
            channel_capacity: 64,
            respawn_delay_ms: 250,
            stats_interval_s: 30,
        }
    }
}

impl SupervisorSettings {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorPhase {
    AwaitingConnection,
    ConnectedLive,
    Restarting,
    Stopped,
}

/// Diagnostics published next to the device state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorStats {
    pub phase: SupervisorPhase,
    pub worker_id: Option<WorkerId>,
    /// Replacements after a fault, not counting the first spawn
    pub restarts: u64,
    pub messages: u64,
}

impl Default for SupervisorStats {
    fn default() -> Self {
        Self {
            phase: SupervisorPhase::Restarting,
            worker_id: None,
            restarts: 0,
            messages: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to build supervisor runtime: {0}")]
    RuntimeError(#[source] std::io::Error),

    #[error("Failed to spawn supervisor thread: {0}")]
    ThreadError(#[source] std::io::Error),

    #[error("Supervisor thread panicked")]
    ThreadPanicked,
}

/// Handle to a running supervisor
///
/// `start()` spawns a dedicated thread running a current-thread tokio runtime
/// that drives the state machine. `stop()` consumes the handle, so it can only
/// be called once; dropping the handle without calling it stops the
/// supervisor as well.
pub struct DeviceSupervisor {
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
    state: StateReader,
    stats: watch::Receiver<SupervisorStats>,
}

impl DeviceSupervisor {
    pub fn start(
        settings: SupervisorSettings,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, SupervisorError> {
        info!("Starting device supervisor with settings: {:?}", settings);

        let published = PublishedState::new();
        let state = published.reader();
        let (stats_sender, stats) = watch::channel(SupervisorStats::default());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("device-supervisor")
            .build()
            .map_err(SupervisorError::RuntimeError)?;

        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("device-supervisor".to_string())
            .spawn(move || {
                let initial = DeviceMachine::<AwaitingConnection>::create(
                    launcher,
                    settings,
                    published,
                    stats_sender,
                );
                runtime.block_on(machine::run(Phase::Restarting(initial), loop_cancel));
                debug!("Supervisor runtime finished");
            })
            .map_err(SupervisorError::ThreadError)?;

        info!("Device supervisor started");
        Ok(Self {
            cancel,
            thread: Some(thread),
            state,
            stats,
        })
    }

    /// Latest state, for the render loop
    pub fn device_state(&self) -> DeviceState {
        self.state.read()
    }

    /// A reader that can be moved to another thread
    pub fn state_reader(&self) -> StateReader {
        self.state.clone()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<SupervisorStats> {
        self.stats.clone()
    }

    /// Stops the worker and joins the supervisor thread
    pub fn stop(mut self) -> Result<(), SupervisorError> {
        info!("Stopping device supervisor");
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SupervisorError> {
        self.cancel.cancel();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|_| {
            error!("Supervisor thread panicked");
            SupervisorError::ThreadPanicked
        })?;
        info!("Device supervisor stopped");
        Ok(())
    }
}

impl Drop for DeviceSupervisor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("DeviceSupervisor dropped without stop(), stopping now");
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests;
