use super::*;
use crate::device::{Acceleration, StateSample};
use crate::protocol::ChannelMessage;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn test_settings() -> SupervisorSettings {
    SupervisorSettings {
        liveness_timeout_ms: 1000,
        shutdown_grace_ms: 50,
        channel_capacity: 16,
        respawn_delay_ms: 20,
        stats_interval_s: 30,
    }
}

// Short enough that a test can sit through a few windows
fn quick_timeout_settings() -> SupervisorSettings {
    SupervisorSettings {
        liveness_timeout_ms: 200,
        ..test_settings()
    }
}

#[derive(Debug, Default)]
struct LauncherLog {
    next_id: u32,
    failures_left: u32,
    senders: Vec<Option<mpsc::Sender<ChannelMessage>>>,
    ids: Vec<WorkerId>,
}

/// Hands out in-memory workers whose channels the test writes to directly
#[derive(Debug, Default)]
struct ScriptedLauncher {
    log: Mutex<LauncherLog>,
    terminated: Arc<Mutex<Vec<WorkerId>>>,
}

impl ScriptedLauncher {
    fn failing_first(failures: u32) -> Self {
        let launcher = Self::default();
        launcher.log.lock().unwrap().failures_left = failures;
        launcher
    }

    fn spawned(&self) -> usize {
        self.log.lock().unwrap().ids.len()
    }

    fn id(&self, index: usize) -> WorkerId {
        self.log.lock().unwrap().ids[index]
    }

    fn send(&self, index: usize, message: ChannelMessage) {
        let sender = self.log.lock().unwrap().senders[index]
            .clone()
            .expect("sender already dropped");
        sender.blocking_send(message).expect("worker channel closed");
    }

    fn close(&self, index: usize) {
        self.log.lock().unwrap().senders[index] = None;
    }

    fn terminated(&self) -> Vec<WorkerId> {
        self.terminated.lock().unwrap().clone()
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn spawn(&self, capacity: usize) -> Result<SpawnedWorker, LaunchError> {
        let mut log = self.log.lock().unwrap();
        if log.failures_left > 0 {
            log.failures_left -= 1;
            return Err(LaunchError::ProgramError("scripted failure".to_string()));
        }
        log.next_id += 1;
        let id = WorkerId(log.next_id);
        let (sender, messages) = mpsc::channel(capacity);
        log.senders.push(Some(sender));
        log.ids.push(id);
        Ok(SpawnedWorker {
            process: Box::new(FakeWorker {
                id,
                terminated: self.terminated.clone(),
            }),
            messages,
        })
    }
}

#[derive(Debug)]
struct FakeWorker {
    id: WorkerId,
    terminated: Arc<Mutex<Vec<WorkerId>>>,
}

#[async_trait]
impl WorkerProcess for FakeWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn terminate(&mut self, _grace: Duration) -> Termination {
        self.terminated.lock().unwrap().push(self.id);
        Termination::Graceful
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn start(launcher: &Arc<ScriptedLauncher>) -> DeviceSupervisor {
    start_with(launcher, test_settings())
}

fn start_with(launcher: &Arc<ScriptedLauncher>, settings: SupervisorSettings) -> DeviceSupervisor {
    let supervisor = DeviceSupervisor::start(settings, launcher.clone()).unwrap();
    assert!(wait_for(|| launcher.spawned() == 1));
    supervisor
}

fn sample(x: f64, y: f64, z: f64, a: bool, b: bool) -> ChannelMessage {
    ChannelMessage::Sample(StateSample::new((x, y, z), a, b))
}

#[test]
fn starts_disconnected_and_awaiting() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    assert!(wait_for(|| supervisor.stats().phase == SupervisorPhase::AwaitingConnection));
    assert_eq!(supervisor.device_state(), DeviceState::disconnected());
    assert_eq!(supervisor.stats().worker_id, Some(launcher.id(0)));

    supervisor.stop().unwrap();
}

#[test]
fn connected_then_samples_publish_the_last_sample() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    launcher.send(0, ChannelMessage::Connected);
    launcher.send(0, sample(1.0, 2.0, 3.0, false, false));
    launcher.send(0, sample(4.0, 5.0, 6.0, true, false));
    launcher.send(0, sample(4.0, 5.0, 6.0, true, true));

    assert!(wait_for(|| supervisor.stats().messages == 4));
    let state = supervisor.device_state();
    assert!(state.is_connected());
    assert_eq!(state.acceleration(), Acceleration::new(4.0, 5.0, 6.0));
    assert!(state.button_a());
    assert!(state.button_b());
    assert_eq!(supervisor.stats().phase, SupervisorPhase::ConnectedLive);

    supervisor.stop().unwrap();
}

#[test]
fn silence_while_awaiting_connection_is_not_a_fault() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start_with(&launcher, quick_timeout_settings());

    std::thread::sleep(quick_timeout_settings().liveness_timeout() * 3);

    assert_eq!(launcher.spawned(), 1);
    assert_eq!(supervisor.stats().restarts, 0);
    assert_eq!(supervisor.stats().phase, SupervisorPhase::AwaitingConnection);

    supervisor.stop().unwrap();
}

#[test]
fn sample_before_connected_is_ignored() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    launcher.send(0, sample(9.0, 9.0, 9.0, true, true));
    assert!(wait_for(|| supervisor.stats().messages == 1));

    assert_eq!(supervisor.device_state(), DeviceState::disconnected());
    assert_eq!(supervisor.stats().phase, SupervisorPhase::AwaitingConnection);

    supervisor.stop().unwrap();
}

#[test]
fn liveness_timeout_resets_state_and_spawns_a_new_worker() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start_with(&launcher, quick_timeout_settings());
    let first = launcher.id(0);

    launcher.send(0, ChannelMessage::Connected);
    launcher.send(0, sample(1.0, 1.0, 1.0, true, false));
    assert!(wait_for(|| supervisor.device_state().button_a()));

    // Worker goes quiet
    assert!(wait_for(|| launcher.spawned() == 2));
    let second = launcher.id(1);
    assert_ne!(first, second);
    assert_eq!(launcher.terminated(), vec![first]);

    // Replacement has not reported a connection yet
    assert_eq!(supervisor.device_state(), DeviceState::disconnected());
    assert!(wait_for(|| supervisor.stats().restarts == 1));
    assert_eq!(supervisor.stats().worker_id, Some(second));

    supervisor.stop().unwrap();
}

#[test]
fn worker_error_restarts_and_recovers() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    launcher.send(0, ChannelMessage::Connected);
    launcher.send(0, sample(2.0, 2.0, 2.0, false, true));
    launcher.send(0, ChannelMessage::error("link lost"));

    assert!(wait_for(|| launcher.spawned() == 2));
    assert!(!supervisor.device_state().is_connected());
    assert!(supervisor.device_state().is_neutral());

    launcher.send(1, ChannelMessage::Connected);
    launcher.send(1, sample(3.0, 3.0, 3.0, true, true));
    assert!(wait_for(|| supervisor.device_state().acceleration()
        == Acceleration::new(3.0, 3.0, 3.0)));
    assert!(supervisor.device_state().is_connected());
    assert_eq!(supervisor.stats().phase, SupervisorPhase::ConnectedLive);
    assert_eq!(supervisor.stats().restarts, 1);

    supervisor.stop().unwrap();
}

#[test]
fn error_while_awaiting_connection_restarts() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    launcher.send(0, ChannelMessage::error("driver init failed"));

    assert!(wait_for(|| launcher.spawned() == 2));
    assert_eq!(launcher.terminated(), vec![launcher.id(0)]);

    supervisor.stop().unwrap();
}

#[test]
fn closed_channel_restarts() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    launcher.send(0, ChannelMessage::Connected);
    assert!(wait_for(|| supervisor.device_state().is_connected()));
    launcher.close(0);

    assert!(wait_for(|| launcher.spawned() == 2));
    assert!(!supervisor.device_state().is_connected());

    supervisor.stop().unwrap();
}

#[test]
fn keeps_restarting_without_limit() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);

    for round in 0..5 {
        launcher.send(round, ChannelMessage::Connected);
        launcher.send(round, ChannelMessage::error("flaky"));
        assert!(wait_for(|| launcher.spawned() == round + 2));
    }

    launcher.send(5, ChannelMessage::Connected);
    assert!(wait_for(|| supervisor.device_state().is_connected()));
    assert!(wait_for(|| supervisor.stats().restarts == 5));

    supervisor.stop().unwrap();
}

#[test]
fn spawn_failures_are_retried() {
    let launcher = Arc::new(ScriptedLauncher::failing_first(3));
    let supervisor = DeviceSupervisor::start(test_settings(), launcher.clone()).unwrap();

    assert!(wait_for(|| launcher.spawned() == 1));
    assert!(wait_for(|| supervisor.stats().phase == SupervisorPhase::AwaitingConnection));

    launcher.send(0, ChannelMessage::Connected);
    assert!(wait_for(|| supervisor.device_state().is_connected()));

    supervisor.stop().unwrap();
}

#[test]
fn disconnected_reads_are_always_neutral() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);
    let reader = supervisor.state_reader();

    let observer = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_millis(800);
        while Instant::now() < deadline {
            let state = reader.read();
            if !state.is_connected() {
                assert!(state.is_neutral(), "disconnected but not neutral: {:?}", state);
            }
        }
    });

    launcher.send(0, ChannelMessage::Connected);
    for i in 0..10 {
        launcher.send(0, sample(i as f64, 1.0, 1.0, i % 2 == 0, true));
    }
    launcher.send(0, ChannelMessage::error("drop"));
    assert!(wait_for(|| launcher.spawned() == 2));

    observer.join().unwrap();
    supervisor.stop().unwrap();
}

#[test]
fn stop_terminates_worker_and_leaves_state_neutral() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);
    let reader = supervisor.state_reader();
    let mut stats = supervisor.subscribe_stats();

    launcher.send(0, ChannelMessage::Connected);
    launcher.send(0, sample(1.0, 2.0, 3.0, true, true));
    assert!(wait_for(|| reader.read().is_connected()));

    supervisor.stop().unwrap();

    assert_eq!(launcher.terminated(), vec![launcher.id(0)]);
    assert_eq!(reader.read(), DeviceState::disconnected());
    assert_eq!(stats.borrow_and_update().phase, SupervisorPhase::Stopped);
}

#[test]
fn dropping_the_handle_stops_the_supervisor() {
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = start(&launcher);
    let id = launcher.id(0);

    drop(supervisor);

    assert_eq!(launcher.terminated(), vec![id]);
}
