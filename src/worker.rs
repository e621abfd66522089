//! Worker process body
//!
//! Runs in a child process started by the supervisor (`remote-kiosk worker
//! <settings-json>`). It owns the driver and talks to the supervisor only
//! through stdout (messages) and stdin (commands):
//!
//! ```text
//! connect loop ──Connected──► poll loop ──Sample...──► stdout
//!      ▲ retry ≥100ms              │ driver error
//!      └── not found               └──Error──► exit
//! ```
//!
//! A stop command, or stdin closing, sets a [`StopFlag`] that both loops check
//! between driver calls. A driver call that never returns cannot observe the
//! flag; the supervisor kills the process in that case.

use crate::driver::{
    DriverError, DriverKind, GamepadDriver, RemoteDriver, SimulatedDriver, SimulationScript,
};
use crate::protocol::{self, ChannelMessage, MessageWriter, ProtocolError, WorkerCommand};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lower bound on the delay between connection attempts
pub const MIN_CONNECT_RETRY_MS: u64 = 100;

const STOP_CHECK_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Sleep between polls; sets the sample rate
    pub poll_interval_ms: u64,
    /// Sleep between connection attempts, never below [`MIN_CONNECT_RETRY_MS`]
    pub connect_retry_ms: u64,
    pub driver: DriverKind,
    pub deadzone: f32,
    /// Only read when `driver` is `simulated`
    pub simulation: SimulationScript,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            connect_retry_ms: MIN_CONNECT_RETRY_MS,
            driver: DriverKind::Gamepad,
            deadzone: 0.05,
            simulation: SimulationScript::default(),
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms.max(MIN_CONNECT_RETRY_MS))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid worker settings: {0}")]
    SettingsError(String),

    #[error("Driver error: {0}")]
    DriverError(#[from] DriverError),

    #[error("Channel error: {0}")]
    ChannelError(#[from] ProtocolError),
}

/// How the worker loop ended
#[derive(Debug)]
pub enum WorkerExit {
    /// Stop was requested
    Stopped,
    /// The driver reported a fault after connecting; an `Error` was sent
    DeviceFault(DriverError),
}

impl WorkerExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Stopped => 0,
            WorkerExit::DeviceFault(_) => 1,
        }
    }
}

/// Cooperative stop signal shared between the stdin watcher and the loops
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleeps for `duration` in short slices. Returns true if stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(STOP_CHECK_SLICE.min(deadline - now));
        }
    }
}

/// Connect, then poll until stopped or the driver faults
pub fn run_worker<D: RemoteDriver, W: Write>(
    driver: &mut D,
    settings: &WorkerSettings,
    out: &mut MessageWriter<W>,
    stop: &StopFlag,
) -> Result<WorkerExit, WorkerError> {
    info!("Worker starting with {} driver", driver.name());

    let mut attempts: u64 = 0;
    let mut handle = loop {
        if stop.is_set() {
            info!("Stop requested before a remote was found");
            return Ok(WorkerExit::Stopped);
        }
        attempts += 1;
        match driver.connect() {
            Ok(handle) => {
                info!("Remote connected after {} attempt(s)", attempts);
                if let Err(e) = out.send(&ChannelMessage::Connected) {
                    driver.release(handle);
                    return Err(e.into());
                }
                break handle;
            }
            Err(e) => debug!("Connection attempt {} failed: {}", attempts, e),
        }
        if stop.sleep(settings.connect_retry()) {
            info!("Stop requested while waiting for a remote");
            return Ok(WorkerExit::Stopped);
        }
    };

    let mut samples: u64 = 0;
    loop {
        if stop.is_set() {
            break;
        }
        match driver.poll(&mut handle) {
            Ok(sample) => {
                samples += 1;
                let sample = if sample.acceleration.is_finite() {
                    sample
                } else {
                    warn!("Driver reported non-finite motion {}, zeroing", sample.acceleration);
                    sample.with_finite_axes()
                };
                if let Err(e) = out.send(&ChannelMessage::Sample(sample)) {
                    error!("Failed to send sample: {}", e);
                    driver.release(handle);
                    return Err(e.into());
                }
            }
            Err(e) => {
                warn!("Driver fault after {} samples: {}", samples, e);
                if let Err(send_err) = out.send(&ChannelMessage::error(e.to_string())) {
                    error!("Failed to report driver fault: {}", send_err);
                }
                driver.release(handle);
                return Ok(WorkerExit::DeviceFault(e));
            }
        }
        if stop.sleep(settings.poll_interval()) {
            break;
        }
    }

    info!("Stop requested after {} samples, releasing remote", samples);
    driver.release(handle);
    Ok(WorkerExit::Stopped)
}

/// Reads commands from `input` until stop, EOF, or a read error
pub fn watch_commands<R: BufRead>(input: R, stop: &StopFlag) {
    for line in input.lines() {
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match protocol::decode_line::<WorkerCommand>(&line) {
                Ok(WorkerCommand::Stop) => {
                    debug!("Stop command received");
                    break;
                }
                Err(e) => warn!("Ignoring command: {}", e),
            },
            Err(e) => {
                warn!("Command input failed: {}", e);
                break;
            }
        }
    }
    stop.set();
}

/// Worker process entry point
///
/// `settings_json` is the serialized [`WorkerSettings`] passed on the command line.
pub fn run_process(settings_json: &str) -> Result<WorkerExit, WorkerError> {
    let settings: WorkerSettings = serde_json::from_str(settings_json)
        .map_err(|e| WorkerError::SettingsError(e.to_string()))?;
    debug!("Worker settings: {:?}", settings);

    let stop = StopFlag::new();
    let watcher_stop = stop.clone();
    std::thread::Builder::new()
        .name("worker-commands".to_string())
        .spawn(move || watch_commands(std::io::stdin().lock(), &watcher_stop))
        .map_err(|e| WorkerError::SettingsError(format!("failed to watch stdin: {}", e)))?;

    let mut out = MessageWriter::new(std::io::stdout().lock());
    match settings.driver {
        DriverKind::Gamepad => {
            let mut driver = match GamepadDriver::new() {
                Ok(driver) => driver.with_deadzone(settings.deadzone),
                Err(e) => {
                    // Last word to the supervisor before exiting
                    let _ = out.send(&ChannelMessage::error(e.to_string()));
                    return Err(e.into());
                }
            };
            run_worker(&mut driver, &settings, &mut out, &stop)
        }
        DriverKind::Simulated => {
            let mut driver = SimulatedDriver::new(settings.simulation.clone());
            run_worker(&mut driver, &settings, &mut out, &stop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StateSample;
    use crate::driver::Exhausted;

    fn settings(script: SimulationScript) -> WorkerSettings {
        WorkerSettings {
            poll_interval_ms: 5,
            connect_retry_ms: 0,
            driver: DriverKind::Simulated,
            deadzone: 0.05,
            simulation: script,
        }
    }

    fn messages(out: MessageWriter<Vec<u8>>) -> Vec<ChannelMessage> {
        String::from_utf8(out.into_inner())
            .unwrap()
            .lines()
            .map(|l| protocol::decode_line(l).unwrap())
            .collect()
    }

    #[test]
    fn connect_retry_is_never_below_floor() {
        let s = WorkerSettings {
            connect_retry_ms: 5,
            ..WorkerSettings::default()
        };
        assert_eq!(s.connect_retry(), Duration::from_millis(MIN_CONNECT_RETRY_MS));
    }

    #[test]
    fn reports_connect_samples_then_error_on_fault() {
        let script = SimulationScript {
            connect_after: 2,
            samples: vec![
                StateSample::new((1.0, 2.0, 3.0), false, false),
                StateSample::new((4.0, 5.0, 6.0), true, false),
            ],
            then: Exhausted::Fail,
        };
        let settings = settings(script);
        let mut driver = SimulatedDriver::new(settings.simulation.clone());
        let mut out = MessageWriter::new(Vec::new());

        let started = Instant::now();
        let exit = run_worker(&mut driver, &settings, &mut out, &StopFlag::new()).unwrap();

        assert!(matches!(exit, WorkerExit::DeviceFault(_)));
        assert_eq!(exit.exit_code(), 1);
        // Two failed attempts, each followed by the retry floor
        assert!(started.elapsed() >= Duration::from_millis(2 * MIN_CONNECT_RETRY_MS));

        let sent = messages(out);
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0], ChannelMessage::Connected);
        assert_eq!(
            sent[1],
            ChannelMessage::Sample(StateSample::new((1.0, 2.0, 3.0), false, false))
        );
        assert_eq!(
            sent[2],
            ChannelMessage::Sample(StateSample::new((4.0, 5.0, 6.0), true, false))
        );
        assert!(matches!(sent[3], ChannelMessage::Error { .. }));
    }

    #[test]
    fn non_finite_motion_is_sent_as_zero() {
        let settings = settings(SimulationScript {
            samples: vec![StateSample::new((f64::NAN, f64::INFINITY, 3.0), true, false)],
            then: Exhausted::Fail,
            ..SimulationScript::default()
        });
        let mut driver = SimulatedDriver::new(settings.simulation.clone());
        let mut out = MessageWriter::new(Vec::new());

        run_worker(&mut driver, &settings, &mut out, &StopFlag::new()).unwrap();

        // Every line must decode, or the supervisor would see silence
        let sent = messages(out);
        assert_eq!(
            sent[1],
            ChannelMessage::Sample(StateSample::new((0.0, 0.0, 3.0), true, false))
        );
    }

    #[test]
    fn stop_before_connect_sends_nothing() {
        let settings = settings(SimulationScript::default());
        let mut driver = SimulatedDriver::new(settings.simulation.clone());
        let mut out = MessageWriter::new(Vec::new());
        let stop = StopFlag::new();
        stop.set();

        let exit = run_worker(&mut driver, &settings, &mut out, &stop).unwrap();
        assert!(matches!(exit, WorkerExit::Stopped));
        assert!(messages(out).is_empty());
    }

    #[test]
    fn stop_while_polling_exits_cleanly() {
        let settings = settings(SimulationScript {
            samples: vec![StateSample::new((0.5, 0.5, 0.5), true, true)],
            ..SimulationScript::default()
        });
        let mut driver = SimulatedDriver::new(settings.simulation.clone());
        let mut out = MessageWriter::new(Vec::new());
        let stop = StopFlag::new();

        let remote_stop = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            remote_stop.set();
        });

        let exit = run_worker(&mut driver, &settings, &mut out, &stop).unwrap();
        stopper.join().unwrap();

        assert_eq!(exit.exit_code(), 0);
        let sent = messages(out);
        assert_eq!(sent[0], ChannelMessage::Connected);
        assert!(sent.len() > 1);
        assert!(sent[1..]
            .iter()
            .all(|m| matches!(m, ChannelMessage::Sample(_))));
    }

    #[test]
    fn stop_command_and_eof_both_set_flag() {
        let stop = StopFlag::new();
        watch_commands("garbage\n{\"type\":\"stop\"}\n".as_bytes(), &stop);
        assert!(stop.is_set());

        let stop = StopFlag::new();
        watch_commands("".as_bytes(), &stop);
        assert!(stop.is_set());
    }

    #[test]
    fn sleep_returns_early_when_stopped() {
        let stop = StopFlag::new();
        stop.set();
        let started = Instant::now();
        assert!(stop.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
