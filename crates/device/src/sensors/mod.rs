//! Sensor acquisition: reads the raw lines through a [`SensorBus`] and turns
//! them into a calibrated [`TelemetrySample`]. Read faults degrade to
//! sentinel values and are never propagated.

#[cfg(feature = "adc")]
pub mod adc;
#[cfg(feature = "sim")]
pub mod sim;

use anyhow::Result;
use tracing::warn;

use crate::config::Config;
use crate::telemetry::TelemetrySample;

/// Value reported for a temperature or humidity that could not be read.
pub const READ_FAILURE_SENTINEL: f32 = 0.0;

/// Raw access to the four sensor lines.
pub trait SensorBus {
    /// Degrees Celsius.
    fn read_temperature(&mut self) -> Result<f32>;
    /// Relative humidity, percent.
    fn read_humidity(&mut self) -> Result<f32>;
    /// Raw ADC counts from the soil probe.
    fn read_moisture_raw(&mut self) -> Result<i32>;
    /// Logic level of the rain detector's digital output (`true` = high).
    fn read_rain_level(&mut self) -> Result<bool>;

    /// Told the applied pump state after every actuator update. Only the
    /// simulator cares.
    fn observe_pump(&mut self, _on: bool) {}
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Linear map from raw probe counts to 0–100 % soil moisture.
///
/// Capacitive probes read *lower* when wet, so `raw_dry > raw_wet` is the
/// usual orientation; the reverse works the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationRange {
    raw_dry: i32,
    raw_wet: i32,
}

impl CalibrationRange {
    pub fn new(raw_dry: i32, raw_wet: i32) -> Self {
        Self { raw_dry, raw_wet }
    }

    /// `raw_dry` → 0, `raw_wet` → 100, always clamped to [0, 100].
    pub fn percent(&self, raw: i32) -> u8 {
        let span = i64::from(self.raw_wet) - i64::from(self.raw_dry);
        if span == 0 {
            return 0;
        }
        let pct = (i64::from(raw) - i64::from(self.raw_dry)) * 100 / span;
        pct.clamp(0, 100) as u8
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Read every line once and build a sample. `pump` is the currently applied
/// actuator state.
pub fn acquire(bus: &mut dyn SensorBus, calibration: &CalibrationRange, pump: bool) -> TelemetrySample {
    let temperature = finite_or_sentinel("temperature", bus.read_temperature());
    let humidity = finite_or_sentinel("humidity", bus.read_humidity());

    let soil_moisture_percent = match bus.read_moisture_raw() {
        Ok(raw) => calibration.percent(raw),
        Err(e) => {
            warn!("sensors: moisture read failed: {e:#}: reporting 0%");
            0
        }
    };

    // Active-low: the detector pulls its output low when wet.
    let raining = match bus.read_rain_level() {
        Ok(level_high) => !level_high,
        Err(e) => {
            warn!("sensors: rain read failed: {e:#}: reporting dry");
            false
        }
    };

    TelemetrySample::new(temperature, humidity, soil_moisture_percent, raining, pump)
}

fn finite_or_sentinel(name: &str, reading: Result<f32>) -> f32 {
    match reading {
        Ok(v) if v.is_finite() => v,
        Ok(v) => {
            warn!(sensor = name, value = %v, "sensors: non-finite reading: using sentinel");
            READ_FAILURE_SENTINEL
        }
        Err(e) => {
            warn!(sensor = name, "sensors: read failed: {e:#}: using sentinel");
            READ_FAILURE_SENTINEL
        }
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Open the sensor backend chosen at build time: real hardware with the
/// `adc` feature, otherwise the simulator.
#[cfg(feature = "adc")]
pub fn open(cfg: &Config) -> Result<Box<dyn SensorBus>> {
    Ok(Box::new(adc::PiSensors::new(&cfg.hardware)?))
}

#[cfg(all(feature = "sim", not(feature = "adc")))]
pub fn open(cfg: &Config) -> Result<Box<dyn SensorBus>> {
    let scenario = std::env::var("SIM_SCENARIO").unwrap_or_default();
    let scenario = sim::Scenario::from_str_lossy(&scenario);
    tracing::info!(%scenario, "sensors: using simulator");
    Ok(Box::new(sim::SimSensors::new(
        scenario,
        cfg.calibration.raw_dry as f64,
        cfg.calibration.raw_wet as f64,
    )))
}

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable the `adc` feature for hardware sensors or `sim` for the simulator");

// ===========================================================================
// Tests
// ===========================================================================
