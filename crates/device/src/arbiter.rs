//! Command arbiter: resolves automatic, manual and emergency-stop control
//! into one desired pump state per cycle.
//!
//! ## Mode state machine
//!
//! ```text
//!         manual-on                  now >= until
//!  Auto ─────────────▶ Manual{until} ─────────────▶ Auto
//!   │                      │
//!   │ stop                 │ stop
//!   ▼                      ▼
//!  EmergencyStop ◀─────────┘
//!   │
//!   └──[rearm, only if allow_rearm]──▶ Auto
//! ```
//!
//! Emergency stop never times out. Without re-arm enabled it lasts until the
//! process restarts.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::ControlConfig;
use crate::pulse::PulseScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Auto,
    /// Pump forced on until the override deadline.
    Manual { until: Instant },
    /// Pump forced off until an explicit re-arm.
    EmergencyStop,
}

impl ControlMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual { .. } => "manual",
            Self::EmergencyStop => "emergency-stop",
        }
    }
}

/// Last intensity received from the decision service.
#[derive(Debug, Clone, Copy)]
struct IntensityReading {
    level: i64,
    received_at: Instant,
}

pub struct Arbiter {
    mode: ControlMode,
    scheduler: PulseScheduler,
    intensity: Option<IntensityReading>,
    manual_timeout: Duration,
    intensity_max_age: Option<Duration>,
    allow_rearm: bool,
}

impl Arbiter {
    /// Start in automatic mode with the pulse grid anchored at `origin`.
    pub fn new(cfg: &ControlConfig, origin: Instant) -> Self {
        Self {
            mode: ControlMode::Auto,
            scheduler: PulseScheduler::new(
                origin,
                cfg.cycle_period(),
                cfg.short_pulse(),
                cfg.long_pulse(),
            ),
            intensity: None,
            manual_timeout: cfg.manual_timeout(),
            intensity_max_age: cfg.intensity_max_age(),
            allow_rearm: cfg.allow_rearm,
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn scheduler(&self) -> &PulseScheduler {
        &self.scheduler
    }

    /// Apply one inbound command. Returns `true` if the mode changed.
    pub fn handle(&mut self, command: Command, now: Instant) -> bool {
        let before = self.mode;

        match (command, self.mode) {
            (Command::Intensity(level), _) => {
                self.intensity = Some(IntensityReading {
                    level,
                    received_at: now,
                });
                debug!(intensity = level, mode = self.mode.name(), "arbiter: intensity updated");
            }

            (Command::ManualOn, ControlMode::EmergencyStop) => {
                warn!("arbiter: manual-on ignored during emergency stop");
            }
            (Command::ManualOn, ControlMode::Manual { .. }) => {
                self.mode = ControlMode::Manual {
                    until: now + self.manual_timeout,
                };
                info!(
                    timeout_secs = self.manual_timeout.as_secs(),
                    "arbiter: manual override window restarted"
                );
            }
            (Command::ManualOn, ControlMode::Auto) => {
                self.scheduler.discard();
                self.mode = ControlMode::Manual {
                    until: now + self.manual_timeout,
                };
            }

            (Command::Stop, ControlMode::EmergencyStop) => {
                debug!("arbiter: already in emergency stop");
            }
            (Command::Stop, _) => {
                self.scheduler.discard();
                self.mode = ControlMode::EmergencyStop;
            }

            (Command::Rearm, ControlMode::EmergencyStop) if self.allow_rearm => {
                self.scheduler.resume(now);
                self.mode = ControlMode::Auto;
            }
            (Command::Rearm, ControlMode::EmergencyStop) => {
                warn!("arbiter: rearm ignored: emergency stop is latched until restart");
            }
            (Command::Rearm, _) => {
                debug!(mode = self.mode.name(), "arbiter: rearm outside emergency stop is a no-op");
            }
        }

        let changed = before.name() != self.mode.name();
        if changed {
            info!(
                from = before.name(),
                to = self.mode.name(),
                command = %command,
                "arbiter: mode change"
            );
        }
        changed
    }

    /// Expire the manual window if due and compute the pump command for this
    /// cycle.
    pub fn evaluate(&mut self, now: Instant) -> bool {
        if let ControlMode::Manual { until } = self.mode {
            if now >= until {
                info!("arbiter: manual override expired: back to auto");
                self.mode = ControlMode::Auto;
                self.scheduler.resume(now);
            }
        }

        match self.mode {
            ControlMode::Auto => {
                let reading = self.intensity;
                let max_age = self.intensity_max_age;
                self.scheduler
                    .tick(now, || effective_intensity(reading, max_age, now))
            }
            ControlMode::Manual { .. } => true,
            ControlMode::EmergencyStop => false,
        }
    }
}

/// Intensity the scheduler should act on at `now`: 0 when nothing has been
/// received yet or the last value is older than `max_age`.
fn effective_intensity(
    reading: Option<IntensityReading>,
    max_age: Option<Duration>,
    now: Instant,
) -> i64 {
    let Some(reading) = reading else {
        return 0;
    };

    if let Some(max_age) = max_age {
        let age = now.saturating_duration_since(reading.received_at);
        if age > max_age {
            warn!(
                age_secs = age.as_secs(),
                max_age_secs = max_age.as_secs(),
                "arbiter: intensity is stale: treating as 0"
            );
            return 0;
        }
    }

    reading.level
}

// ===========================================================================
// Tests
// ===========================================================================
