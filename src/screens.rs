//! Screen flow driven by the remote
//!
//! Pure consumer of [`DeviceState`]: the render loop calls
//! [`ScreenFlow::update`] once per frame and gets back a transition request
//! whenever the kiosk should move to another screen. Drawing, easing and
//! assets live elsewhere.
//!
//! ```text
//! IntroConnect ──connected──► Calibration ──held still──► Home ──A+B──► Welcome
//!       ▲                          │                        │             │
//!       └──────────────────────────┴────── disconnected ────┴─────────────┘
//! ```

use crate::device::{Acceleration, DeviceState};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Screen {
    IntroConnect,
    Calibration,
    Home,
    Welcome,
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Screen::IntroConnect => "intro-connect",
            Screen::Calibration => "calibration",
            Screen::Home => "home",
            Screen::Welcome => "welcome",
        };
        f.write_str(name)
    }
}

/// Request to the renderer to move from one screen to another
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScreenTransition {
    pub from: Screen,
    pub to: Screen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSettings {
    /// Seconds the remote must be held still to finish calibration
    pub calibration_still_s: f64,
    /// Largest per-frame summed acceleration change that still counts as still
    pub calibration_threshold: f64,
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            calibration_still_s: 4.0,
            calibration_threshold: 2.0,
        }
    }
}

#[derive(Debug)]
pub struct ScreenFlow {
    settings: ScreenSettings,
    screen: Screen,
    still_for: f64,
    last_acceleration: Option<Acceleration>,
}

impl ScreenFlow {
    pub fn new(settings: ScreenSettings) -> Self {
        Self {
            settings,
            screen: Screen::IntroConnect,
            still_for: 0.0,
            last_acceleration: None,
        }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    /// Advances by `dt` seconds with this frame's snapshot
    pub fn update(&mut self, dt: f64, state: &DeviceState) -> Option<ScreenTransition> {
        let next = match self.screen {
            Screen::IntroConnect if state.is_connected() => Some(Screen::Calibration),
            Screen::IntroConnect => None,
            _ if !state.is_connected() => Some(Screen::IntroConnect),
            Screen::Calibration => self.calibrate(dt, state.acceleration()),
            Screen::Home if state.button_a() && state.button_b() => Some(Screen::Welcome),
            Screen::Home | Screen::Welcome => None,
        };

        next.map(|to| self.enter(to))
    }

    fn calibrate(&mut self, dt: f64, acceleration: Acceleration) -> Option<Screen> {
        let change = self
            .last_acceleration
            .map(|last| acceleration.abs_delta(&last))
            .unwrap_or(0.0);
        self.last_acceleration = Some(acceleration);

        if change < self.settings.calibration_threshold {
            self.still_for += dt;
        } else {
            debug!("Calibration reset, remote moved by {:.2}", change);
            self.still_for = 0.0;
        }

        (self.still_for >= self.settings.calibration_still_s).then_some(Screen::Home)
    }

    fn enter(&mut self, to: Screen) -> ScreenTransition {
        let transition = ScreenTransition {
            from: self.screen,
            to,
        };
        info!("Screen transition: {} -> {}", transition.from, transition.to);
        self.screen = to;
        self.still_for = 0.0;
        self.last_acceleration = None;
        transition
    }
}
