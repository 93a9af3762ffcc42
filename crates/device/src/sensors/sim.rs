//! Stateful sensor simulator for local development.
//!
//! Models a single capacitive moisture probe plus the DHT and rain board:
//! - Soil moisture random walk with mean reversion and drying drift
//! - Closed-loop wetting while the pump runs
//! - Day/night temperature swing with humidity moving the other way
//! - Rain showers that start and stop at random and wet the soil
//! - Occasional DHT read failures

use anyhow::{bail, Result};
use std::fmt;

use super::SensorBus;

/// Samples per simulated day (one per telemetry cycle).
const DIURNAL_PERIOD_SAMPLES: f64 = 360.0;

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mid-range start, steady drying, rare showers.
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Noisy probe and frequent DHT failures.
    Flaky,
    /// Starts near the wet end; rainy weather.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimSensors {
    raw_dry: f64,
    raw_wet: f64,
    center: f64,

    /// Current "true" moisture in ADC units.
    base: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,

    /// Change in ADC units per sample while the pump runs (toward wet).
    wet_rate: f64,
    pumping: bool,

    raining: bool,
    rain_start_prob: f32,
    rain_stop_prob: f32,

    dht_failure_prob: f32,
    sample: u64,
}

impl SimSensors {
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        let range = raw_dry - raw_wet;

        // start_frac: 0.0 = at raw_wet, 1.0 = at raw_dry
        let (drift_frac, walk_frac, noise_frac, rain_start, dht_fail, start_frac) = match scenario {
            Scenario::Drying => (0.001, 0.01, 0.006, 0.003_f32, 0.02_f32, 0.5),
            Scenario::Stable => (0.0002, 0.004, 0.003, 0.001, 0.005, 0.5),
            Scenario::Flaky => (0.0008, 0.02, 0.015, 0.003, 0.2, 0.5),
            Scenario::Wet => (0.0002, 0.006, 0.004, 0.02, 0.02, 0.2),
        };

        Self {
            raw_dry,
            raw_wet,
            center: (raw_dry + raw_wet) / 2.0,
            base: raw_wet + start_frac * range,
            drift_per_sample: drift_frac * range,
            walk_sigma: walk_frac * range.abs(),
            mean_reversion: 0.02,
            noise_sigma: noise_frac * range.abs(),
            wet_rate: -0.02 * range,
            pumping: false,
            raining: false,
            rain_start_prob: rain_start,
            rain_stop_prob: 0.05,
            dht_failure_prob: dht_fail,
            sample: 0,
        }
    }

    fn diurnal_phase(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.sample as f64 / DIURNAL_PERIOD_SAMPLES
    }

    fn dht_fails(&self) -> bool {
        fastrand::f32() < self.dht_failure_prob
    }

    fn step_weather(&mut self) {
        if self.raining {
            if fastrand::f32() < self.rain_stop_prob {
                self.raining = false;
            }
        } else if fastrand::f32() < self.rain_start_prob {
            self.raining = true;
        }
    }
}

impl SensorBus for SimSensors {
    fn read_temperature(&mut self) -> Result<f32> {
        if self.dht_fails() {
            bail!("simulated dht timeout");
        }
        // Peaks mid-afternoon, cooler while raining.
        let rain_cooling = if self.raining { -3.0 } else { 0.0 };
        let t = 28.0 + 4.0 * self.diurnal_phase().sin() + rain_cooling + gaussian(0.0, 0.3);
        Ok(t as f32)
    }

    fn read_humidity(&mut self) -> Result<f32> {
        if self.dht_fails() {
            bail!("simulated dht timeout");
        }
        let rain_boost = if self.raining { 20.0 } else { 0.0 };
        let h = 70.0 - 12.0 * self.diurnal_phase().sin() + rain_boost + gaussian(0.0, 1.5);
        Ok(h.clamp(0.0, 100.0) as f32)
    }

    fn read_moisture_raw(&mut self) -> Result<i32> {
        self.sample += 1;
        self.step_weather();

        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let mut wet = 0.0;
        if self.pumping {
            wet += self.wet_rate;
        }
        if self.raining {
            wet += self.wet_rate / 2.0;
        }

        let lo = self.raw_wet.min(self.raw_dry);
        let hi = self.raw_wet.max(self.raw_dry);
        let margin = (hi - lo) * 0.05;
        self.base = (self.base + self.drift_per_sample + pull + walk + wet)
            .clamp(lo - margin, hi + margin);

        let reading = self.base + gaussian(0.0, self.noise_sigma);
        // Physically possible ADS1115 single-ended range.
        Ok(reading.round().clamp(0.0, 32767.0) as i32)
    }

    fn read_rain_level(&mut self) -> Result<bool> {
        // Active-low board: output low while wet.
        Ok(!self.raining)
    }

    fn observe_pump(&mut self, on: bool) {
        self.pumping = on;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
