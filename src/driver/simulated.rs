use super::{DriverError, RemoteDriver};
use crate::device::StateSample;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the simulated remote does once its scripted samples run out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhausted {
    /// Keep reporting the last sample
    #[default]
    Repeat,
    /// Start over from the first sample
    Cycle,
    /// Report a device error
    Fail,
    /// Block inside poll forever, like a driver whose link vanished
    Hang,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationScript {
    /// Connection attempts that fail before one succeeds
    pub connect_after: u32,
    pub samples: Vec<StateSample>,
    pub then: Exhausted,
}

pub struct SimulatedDriver {
    script: SimulationScript,
    failed_attempts: u32,
}

/// Position in the script for one connection
#[derive(Debug)]
pub struct SimulatedHandle {
    next: usize,
}

impl SimulatedDriver {
    pub fn new(script: SimulationScript) -> Self {
        debug!("Creating simulated driver with script: {:?}", script);
        Self {
            script,
            failed_attempts: 0,
        }
    }
}

impl RemoteDriver for SimulatedDriver {
    type Handle = SimulatedHandle;

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn connect(&mut self) -> Result<SimulatedHandle, DriverError> {
        if self.failed_attempts < self.script.connect_after {
            self.failed_attempts += 1;
            return Err(DriverError::NotFound(format!(
                "simulated attempt {} of {}",
                self.failed_attempts, self.script.connect_after
            )));
        }
        info!("Simulated remote connected");
        Ok(SimulatedHandle { next: 0 })
    }

    fn poll(&mut self, handle: &mut SimulatedHandle) -> Result<StateSample, DriverError> {
        if let Some(sample) = self.script.samples.get(handle.next) {
            handle.next += 1;
            return Ok(*sample);
        }

        match self.script.then {
            Exhausted::Repeat => Ok(self.script.samples.last().copied().unwrap_or_default()),
            Exhausted::Cycle => match self.script.samples.first() {
                Some(first) => {
                    handle.next = 1;
                    Ok(*first)
                }
                None => Ok(StateSample::default()),
            },
            Exhausted::Fail => Err(DriverError::DeviceError(
                "simulated remote reported a fault".to_string(),
            )),
            Exhausted::Hang => {
                warn!("Simulated remote hanging inside poll");
                loop {
                    std::thread::sleep(Duration::from_secs(3600));
                }
            }
        }
    }

    fn release(&mut self, _handle: SimulatedHandle) {
        debug!("Simulated remote released");
    }
}
