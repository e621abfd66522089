//! Worker launching and termination
//!
//! [`WorkerLauncher`] is the seam between the state machine and the OS. The
//! machine only sees a [`WorkerProcess`] it can identify and terminate, plus the
//! receiving end of a bounded channel of [`ChannelMessage`]s.
//!
//! [`ProcessLauncher`] starts the kiosk binary in worker mode:
//!
//! ```text
//! child stdout ──lines──► reader task ──decode──► mpsc(capacity) ──► supervisor
//! child stdin  ◄──────────── WorkerCommand::Stop ◄──────────────── terminate()
//! ```

use crate::protocol::{self, ChannelMessage, WorkerCommand};
use crate::worker::WorkerSettings;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identity of one spawned worker; a respawn always gets a new one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// How a worker ended when terminated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited before the stop was sent
    AlreadyExited,
    /// It exited on its own within the grace period
    Graceful,
    /// It ignored the stop and was killed
    Killed,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to resolve worker program: {0}")]
    ProgramError(String),

    #[error("Failed to encode worker settings: {0}")]
    SettingsError(String),

    #[error("Failed to spawn worker: {0}")]
    SpawnError(#[from] std::io::Error),

    #[error("Worker pipe unavailable: {0}")]
    PipeError(String),
}

/// A running worker owned by the supervisor
#[async_trait]
pub trait WorkerProcess: Send + fmt::Debug {
    fn id(&self) -> WorkerId;

    /// Asks the worker to stop, waits up to `grace`, then kills it
    async fn terminate(&mut self, grace: Duration) -> Termination;
}

pub struct SpawnedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub messages: mpsc::Receiver<ChannelMessage>,
}

impl fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Starts a fresh worker with a fresh channel of `capacity` messages.
    /// Called from inside the supervisor's tokio runtime.
    fn spawn(&self, capacity: usize) -> Result<SpawnedWorker, LaunchError>;
}

/// Runs the kiosk binary as `<program> worker <settings-json>`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    settings_json: String,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, settings: &WorkerSettings) -> Result<Self, LaunchError> {
        let settings_json = serde_json::to_string(settings)
            .map_err(|e| LaunchError::SettingsError(e.to_string()))?;
        Ok(Self {
            program: program.into(),
            settings_json,
        })
    }

    /// Launches the running executable in worker mode
    pub fn current_exe(settings: &WorkerSettings) -> Result<Self, LaunchError> {
        let program =
            std::env::current_exe().map_err(|e| LaunchError::ProgramError(e.to_string()))?;
        Self::new(program, settings)
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self, capacity: usize) -> Result<SpawnedWorker, LaunchError> {
        debug!("Spawning worker process {:?}", self.program);
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg(&self.settings_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let id = WorkerId(child.id().unwrap_or_default());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::PipeError("stdout not captured".to_string()))?;
        let stdin = child.stdin.take();

        let (sender, messages) = mpsc::channel(capacity.max(1));
        tokio::spawn(forward_messages(id, stdout, sender));

        info!("Spawned {} from {:?}", id, self.program);
        Ok(SpawnedWorker {
            process: Box::new(ChildWorker { id, child, stdin }),
            messages,
        })
    }
}

// Decodes worker stdout into the channel until EOF or the receiver is dropped
async fn forward_messages(
    id: WorkerId,
    stdout: ChildStdout,
    sender: mpsc::Sender<ChannelMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match protocol::decode_line::<ChannelMessage>(&line) {
                    Ok(message) => {
                        if sender.send(message).await.is_err() {
                            debug!("{} channel receiver dropped, stopping reader", id);
                            return;
                        }
                    }
                    Err(e) => warn!("{} sent an undecodable line: {}", id, e),
                }
            }
            Ok(None) => {
                debug!("{} closed its output", id);
                break;
            }
            Err(e) => {
                warn!("Failed to read from {}: {}", id, e);
                break;
            }
        }
    }
    // Receiver may already be gone during a restart
    let _ = sender
        .send(ChannelMessage::error("worker channel closed"))
        .await;
}

#[derive(Debug)]
struct ChildWorker {
    id: WorkerId,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ChildWorker {
    async fn send_stop(&mut self, grace: Duration) {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };
        let line = match protocol::encode_line(&WorkerCommand::Stop) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode stop command: {}", e);
                return;
            }
        };
        match tokio::time::timeout(grace, stdin.write_all(line.as_bytes())).await {
            Ok(Ok(())) => debug!("Sent stop to {}", self.id),
            Ok(Err(e)) => debug!("Stop to {} not delivered: {}", self.id, e),
            Err(_) => debug!("Stop to {} timed out", self.id),
        }
        // Dropping stdin closes the pipe, which the worker also treats as stop
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            error!("Failed to kill {}: {}", self.id, e);
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn terminate(&mut self, grace: Duration) -> Termination {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} already exited with {}", self.id, status);
                return Termination::AlreadyExited;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to query {}: {}", self.id, e),
        }

        let started = tokio::time::Instant::now();
        self.send_stop(grace).await;
        let remaining = grace.saturating_sub(started.elapsed());

        match tokio::time::timeout(remaining, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} exited with {}", self.id, status);
                Termination::Graceful
            }
            Ok(Err(e)) => {
                warn!("Failed waiting on {}: {}, killing", self.id, e);
                self.kill().await;
                Termination::Killed
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {} ms, killing",
                    self.id,
                    grace.as_millis()
                );
                self.kill().await;
                Termination::Killed
            }
        }
    }
}
