//! Outbound message shapes and the periodic telemetry timer.

use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Periodic sensor + pump snapshot. Sensor faults are reported as 0, never
/// omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// Unix seconds, informational only.
    pub ts: i64,
    pub temperature: f32,
    pub humidity: f32,
    pub soil_moisture_percent: u8,
    pub raining: bool,
    pub pump: bool,
}

/// Emitted once per actual pump transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub pump: bool,
}

impl TelemetrySample {
    pub fn new(
        temperature: f32,
        humidity: f32,
        soil_moisture_percent: u8,
        raining: bool,
        pump: bool,
    ) -> Self {
        let finite = |v: f32| if v.is_finite() { v } else { 0.0 };
        Self {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            temperature: finite(temperature),
            humidity: finite(humidity),
            soil_moisture_percent: soil_moisture_percent.min(100),
            raining,
            pump,
        }
    }
}

/// Serialize a message to a JSON payload. Returns `None` (logged) on failure
/// so a bad sample never stops the loop.
pub fn encode<T: Serialize>(msg: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(msg) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!("telemetry: failed to encode message: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Fixed-period trigger on the monotonic clock. The first sample is due
/// immediately.
pub struct TelemetryTimer {
    interval: Duration,
    next: Instant,
}

impl TelemetryTimer {
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next: start,
        }
    }

    /// Returns `true` once per period. A stalled loop gets one sample, not a
    /// burst of catch-up samples.
    pub fn due(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next += self.interval;
        if self.next <= now {
            self.next = now + self.interval;
        }
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
