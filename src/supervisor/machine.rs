//! Supervisor state machine
//!
//! ```text
//!            ┌──────────── Silence ────────────┐
//!            ▼                                 │
//!   AwaitingConnection ──Connected──► ConnectedLive ──Sample──┐
//!        ▲      │                       │   │  ▲              │
//!        │      └──Error/Closed──┐      │   │  └──────────────┘
//!        │                       ▼      ▼   │
//!        └─────── respawn ─── Restarting ◄──┘ Error / Silence / Closed
//! ```
//!
//! Silence while awaiting a connection is normal. Silence while live means the
//! worker is presumed hung inside a driver call.

use super::launcher::{LaunchError, SpawnedWorker, Termination, WorkerLauncher};
use super::{SupervisorPhase, SupervisorSettings, SupervisorStats};
use crate::device::PublishedState;
use crate::protocol::ChannelMessage;
use chrono::{DateTime, Local};
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the worker is being replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCause {
    /// First spawn, nothing to replace yet
    Startup,
    WorkerError(String),
    LivenessTimeout,
    ChannelClosed,
    SpawnFailed(String),
}

impl fmt::Display for RestartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartCause::Startup => write!(f, "startup"),
            RestartCause::WorkerError(cause) => write!(f, "worker error: {}", cause),
            RestartCause::LivenessTimeout => write!(f, "liveness timeout"),
            RestartCause::ChannelClosed => write!(f, "worker channel closed"),
            RestartCause::SpawnFailed(cause) => write!(f, "spawn failed: {}", cause),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    AwaitingConnection,
    ConnectedLive,
    Restarting(RestartCause),
}

#[machine]
#[derive(Debug)]
pub struct DeviceMachine<S: SupervisorState> {
    // Starts and replaces workers
    launcher: Arc<dyn WorkerLauncher>,

    settings: SupervisorSettings,

    // State seen by the render loop
    published: PublishedState,

    // Current worker and its channel, None only between terminate and respawn
    worker: Option<SpawnedWorker>,

    stats: watch::Sender<SupervisorStats>,

    last_stats_log: DateTime<Local>,
}

enum Received {
    Message(ChannelMessage),
    Silence,
    Closed,
    Cancelled,
}

/// The machine in whichever state it currently is
pub enum Phase {
    Awaiting(DeviceMachine<AwaitingConnection>),
    Live(DeviceMachine<ConnectedLive>),
    Restarting(DeviceMachine<Restarting>),
}

// Methods available in all states
impl<S: SupervisorState> DeviceMachine<S> {
    async fn receive(&mut self, cancel: &CancellationToken) -> Received {
        self.maybe_log_stats();

        let timeout = self.settings.liveness_timeout();
        let Some(worker) = self.worker.as_mut() else {
            return Received::Closed;
        };

        tokio::select! {
            _ = cancel.cancelled() => Received::Cancelled,
            res = tokio::time::timeout(timeout, worker.messages.recv()) => match res {
                Ok(Some(message)) => {
                    self.stats.send_modify(|s| s.messages += 1);
                    Received::Message(message)
                }
                Ok(None) => Received::Closed,
                Err(_) => Received::Silence,
            },
        }
    }

    fn enter(&self, phase: SupervisorPhase) {
        self.stats.send_modify(|s| s.phase = phase);
    }

    async fn terminate_worker(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let id = worker.process.id();
        let outcome = worker.process.terminate(self.settings.shutdown_grace()).await;
        match outcome {
            Termination::Killed => warn!("{} was killed", id),
            other => debug!("{} terminated: {:?}", id, other),
        }
        self.stats.send_modify(|s| s.worker_id = None);
    }

    /// Stops the worker and leaves the published state neutral
    pub async fn shutdown(mut self) {
        info!("Supervisor shutting down");
        self.published.reset();
        self.terminate_worker().await;
        self.enter(SupervisorPhase::Stopped);
        let stats = self.stats.borrow().clone();
        info!(
            "Supervisor stopped after {} restarts and {} messages",
            stats.restarts, stats.messages
        );
    }

    fn maybe_log_stats(&mut self) {
        let now = Local::now();
        let interval = chrono::Duration::seconds(self.settings.stats_interval_s as i64);
        if now - self.last_stats_log > interval {
            let stats = self.stats.borrow().clone();
            info!(
                "Supervisor stats: phase {:?}, {} restarts, {} messages, worker {:?}",
                stats.phase, stats.restarts, stats.messages, stats.worker_id
            );
            self.last_stats_log = now;
        }
    }
}

impl DeviceMachine<AwaitingConnection> {
    /// Builds the machine ready to spawn its first worker
    pub fn create(
        launcher: Arc<dyn WorkerLauncher>,
        settings: SupervisorSettings,
        published: PublishedState,
        stats: watch::Sender<SupervisorStats>,
    ) -> DeviceMachine<Restarting> {
        debug!("Creating supervisor machine with settings: {:?}", settings);
        let machine = Self::new(launcher, settings, published, None, stats, Local::now());
        machine.transition_with(RestartCause::Startup)
    }

    pub async fn await_connection(mut self, cancel: &CancellationToken) -> Phase {
        match self.receive(cancel).await {
            Received::Message(ChannelMessage::Connected) => {
                info!("Remote connected");
                self.published.mark_connected();
                self.enter(SupervisorPhase::ConnectedLive);
                Phase::Live(self.transition())
            }
            Received::Message(ChannelMessage::Sample(_)) => {
                warn!("Ignoring sample received before the connection was reported");
                Phase::Awaiting(self)
            }
            Received::Message(ChannelMessage::Error { cause }) => {
                warn!("Worker failed while connecting: {}", cause);
                self.restart(RestartCause::WorkerError(cause))
            }
            Received::Silence => {
                debug!("Still waiting for the remote");
                Phase::Awaiting(self)
            }
            Received::Closed => self.restart(RestartCause::ChannelClosed),
            Received::Cancelled => Phase::Awaiting(self),
        }
    }

    fn restart(self, cause: RestartCause) -> Phase {
        self.enter(SupervisorPhase::Restarting);
        Phase::Restarting(self.transition_with(cause))
    }
}

impl DeviceMachine<ConnectedLive> {
    pub async fn watch_liveness(mut self, cancel: &CancellationToken) -> Phase {
        match self.receive(cancel).await {
            Received::Message(ChannelMessage::Sample(sample)) => {
                self.published.apply_sample(&sample);
                Phase::Live(self)
            }
            Received::Message(ChannelMessage::Connected) => {
                debug!("Duplicate connected message ignored");
                Phase::Live(self)
            }
            Received::Message(ChannelMessage::Error { cause }) => {
                warn!("Worker reported a device fault: {}", cause);
                self.restart(RestartCause::WorkerError(cause))
            }
            Received::Silence => {
                warn!(
                    "No message from the worker for {} ms, presuming it hung",
                    self.settings.liveness_timeout_ms
                );
                self.restart(RestartCause::LivenessTimeout)
            }
            Received::Closed => self.restart(RestartCause::ChannelClosed),
            Received::Cancelled => Phase::Live(self),
        }
    }

    fn restart(self, cause: RestartCause) -> Phase {
        // Readers must see the neutral state before anything else happens
        self.published.reset();
        self.enter(SupervisorPhase::Restarting);
        Phase::Restarting(self.transition_with(cause))
    }
}

impl DeviceMachine<Restarting> {
    pub async fn respawn(mut self, cancel: &CancellationToken) -> Phase {
        let cause = self
            .get_state_data()
            .cloned()
            .unwrap_or(RestartCause::Startup);

        self.published.reset();
        self.terminate_worker().await;

        if cause != RestartCause::Startup {
            info!("Restarting worker after {}", cause);
            if !self.wait_respawn_delay(cancel).await {
                return Phase::Restarting(self);
            }
        }

        match self.launcher.spawn(self.settings.channel_capacity) {
            Ok(worker) => {
                let id = worker.process.id();
                self.worker = Some(worker);
                self.stats.send_modify(|s| {
                    s.worker_id = Some(id);
                    if cause != RestartCause::Startup {
                        s.restarts += 1;
                    }
                });
                info!("{} started, awaiting connection", id);
                self.enter(SupervisorPhase::AwaitingConnection);
                Phase::Awaiting(self.transition())
            }
            Err(e) => {
                error!("Failed to spawn worker: {}", e);
                Phase::Restarting(self.transition_with(spawn_failure(e)))
            }
        }
    }

    // Returns false if cancelled while waiting
    async fn wait_respawn_delay(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.respawn_delay()) => true,
        }
    }
}

fn spawn_failure(e: LaunchError) -> RestartCause {
    RestartCause::SpawnFailed(e.to_string())
}

impl Phase {
    pub fn kind(&self) -> SupervisorPhase {
        match self {
            Phase::Awaiting(_) => SupervisorPhase::AwaitingConnection,
            Phase::Live(_) => SupervisorPhase::ConnectedLive,
            Phase::Restarting(_) => SupervisorPhase::Restarting,
        }
    }

    pub async fn step(self, cancel: &CancellationToken) -> Phase {
        match self {
            Phase::Awaiting(m) => m.await_connection(cancel).await,
            Phase::Live(m) => m.watch_liveness(cancel).await,
            Phase::Restarting(m) => m.respawn(cancel).await,
        }
    }

    pub async fn shutdown(self) {
        match self {
            Phase::Awaiting(m) => m.shutdown().await,
            Phase::Live(m) => m.shutdown().await,
            Phase::Restarting(m) => m.shutdown().await,
        }
    }
}

/// Drives the machine until `cancel` fires, then shuts the worker down
pub async fn run(mut phase: Phase, cancel: CancellationToken) {
    info!("Supervisor loop started in {:?}", phase.kind());
    loop {
        if cancel.is_cancelled() {
            phase.shutdown().await;
            return;
        }
        phase = phase.step(&cancel).await;
    }
}
