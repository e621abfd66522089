//! Kiosk configuration
//!
//! Read once at startup from TOML. Every section and field has a default, so
//! a partial file, or none at all, is fine:
//!
//! ```toml
//! [supervisor]
//! liveness_timeout_ms = 1000
//!
//! [worker]
//! driver = "simulated"
//!
//! [ui]
//! frame_rate = 60
//! ```

use crate::screens::ScreenSettings;
use crate::supervisor::SupervisorSettings;
use crate::worker::WorkerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides the config file location
pub const CONFIG_ENV: &str = "REMOTE_KIOSK_CONFIG";

const CONFIG_DIR: &str = ".config/remote-kiosk";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    /// Render loop rate; the device state is read once per frame
    pub frame_rate: u32,
    #[serde(flatten)]
    pub screens: ScreenSettings,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            screens: ScreenSettings::default(),
        }
    }
}

impl UiConfig {
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.frame_rate.max(1)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct KioskConfig {
    pub supervisor: SupervisorSettings,
    pub worker: WorkerSettings,
    pub ui: UiConfig,
}

impl KioskConfig {
    /// Loads from `$REMOTE_KIOSK_CONFIG`, then the home config dir, then defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_path(),
        };
        Self::load_from(&path)
    }

    /// A missing file yields defaults; an unreadable or malformed one is an error
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseError { source, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::ParseError {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        debug!("Parsed config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.liveness_timeout_ms <= self.worker.poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "liveness_timeout_ms ({}) must be larger than poll_interval_ms ({})",
                self.supervisor.liveness_timeout_ms, self.worker.poll_interval_ms
            )));
        }
        if !(0.0..1.0).contains(&self.worker.deadzone) {
            return Err(ConfigError::Invalid(format!(
                "deadzone ({}) must be in [0, 1)",
                self.worker.deadzone
            )));
        }
        if self.supervisor.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.ui.frame_rate == 0 {
            return Err(ConfigError::Invalid("frame_rate must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
