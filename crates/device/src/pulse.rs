//! Pulse scheduler: turns the discrete irrigation intensity into timed pump
//! pulses while the controller is in automatic mode.
//!
//! ```text
//!            boundary, intensity 1|2
//!   Off ───────────────────────────────▶ Window { end }
//!    ▲                                        │
//!    └────────────[now >= end]────────────────┘
//! ```
//!
//! Cycle boundaries sit on a fixed grid `origin + k * period`. Only one
//! window exists at a time; a boundary that passes while a window is open is
//! consumed without reopening it.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

pub struct PulseScheduler {
    origin: Instant,
    period: Duration,
    short_pulse: Duration,
    long_pulse: Duration,
    next_cycle: Instant,
    window_end: Option<Instant>,
}

impl PulseScheduler {
    /// The first cycle boundary is `origin` itself.
    pub fn new(origin: Instant, period: Duration, short_pulse: Duration, long_pulse: Duration) -> Self {
        Self {
            origin,
            period,
            short_pulse,
            long_pulse,
            next_cycle: origin,
            window_end: None,
        }
    }

    /// End of the open pulse window, if any.
    pub fn window_end(&self) -> Option<Instant> {
        self.window_end
    }

    pub fn next_cycle(&self) -> Instant {
        self.next_cycle
    }

    /// Pulse length for an intensity level; `None` means stay off.
    pub fn pulse_for(&self, intensity: i64) -> Option<Duration> {
        match intensity {
            1 => Some(self.short_pulse),
            2 => Some(self.long_pulse),
            _ => None,
        }
    }

    /// Advance the schedule to `now` and return whether the pump should run.
    ///
    /// `intensity` is only read when a cycle boundary is reached with no
    /// window open.
    pub fn tick(&mut self, now: Instant, intensity: impl FnOnce() -> i64) -> bool {
        if let Some(end) = self.window_end {
            if now >= end {
                self.window_end = None;
                info!("pulse: window elapsed: pump off");
            }
        }

        if now >= self.next_cycle {
            self.next_cycle = self.boundary_after(now);

            if self.window_end.is_some() {
                debug!("pulse: cycle boundary inside open window: not reopened");
            } else {
                let level = intensity();
                match self.pulse_for(level) {
                    Some(length) => {
                        self.window_end = Some(now + length);
                        info!(
                            intensity = level,
                            pulse_secs = length.as_secs_f32(),
                            "pulse: window opened"
                        );
                    }
                    None => {
                        debug!(intensity = level, "pulse: no pulse this cycle");
                    }
                }
            }
        }

        self.window_end.is_some()
    }

    /// Drop the open window (not paused) when automatic mode is left.
    pub fn discard(&mut self) {
        if self.window_end.take().is_some() {
            info!("pulse: window discarded");
        }
    }

    /// Re-enter automatic mode at `now`: boundaries that elapsed while away
    /// are skipped, and the schedule restarts at the first grid point at or
    /// after `now`.
    pub fn resume(&mut self, now: Instant) {
        self.window_end = None;
        self.next_cycle = self.boundary_at_or_after(now);
        debug!(
            wait_secs = self.next_cycle.saturating_duration_since(now).as_secs_f32(),
            "pulse: schedule resumed"
        );
    }

    fn cycles_since_origin(&self, now: Instant) -> (u128, bool) {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        let period = self.period.as_nanos().max(1);
        (elapsed / period, elapsed % period == 0)
    }

    fn grid_point(&self, k: u128) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(k);
        self.origin + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// First grid point strictly after `now`.
    fn boundary_after(&self, now: Instant) -> Instant {
        let (k, _) = self.cycles_since_origin(now);
        self.grid_point(k + 1)
    }

    fn boundary_at_or_after(&self, now: Instant) -> Instant {
        let (k, exact) = self.cycles_since_origin(now);
        if exact {
            self.grid_point(k)
        } else {
            self.grid_point(k + 1)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
