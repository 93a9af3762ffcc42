//! Raspberry Pi sensor backend.
//!
//! - Soil moisture: ADS1115 16-bit ADC over I2C, single-ended, PGA ±4.096 V,
//!   128 SPS, single-shot mode. Matches the default calibration
//!   (`raw_dry ≈ 26000`, `raw_wet ≈ 12000`) for capacitive probes on 3.3 V.
//! - Rain: digital output of the rain board on a GPIO input (active-low).
//! - Temperature / humidity: the kernel `dht11` IIO driver, which reports
//!   milli-degrees and milli-percent through sysfs.

use anyhow::{anyhow, Context, Result};
use rppal::gpio::{Gpio, InputPin};
use rppal::i2c::I2c;
use std::path::PathBuf;
use std::{fs, thread, time::Duration};

use super::SensorBus;
use crate::config::HardwareConfig;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
//   [15] OS  [14:12] MUX  [11:9] PGA  [8] MODE  [7:5] DR  [1:0] COMP_QUE

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register reads 1 once the conversion is done.
const OS_READY_BIT: u16 = 1 << 15;

const IIO_TEMPERATURE: &str = "in_temp_input";
const IIO_HUMIDITY: &str = "in_humidityrelative_input";

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Parse an IIO sysfs attribute holding a milli-unit integer.
fn parse_milli(contents: &str) -> Result<f32> {
    let milli: i64 = contents
        .trim()
        .parse()
        .map_err(|_| anyhow!("unexpected iio value {:?}", contents.trim()))?;
    Ok(milli as f32 / 1000.0)
}

// ── Backend ─────────────────────────────────────────────────────────────────

pub struct PiSensors {
    i2c: I2c,
    moisture_channel: usize,
    rain: InputPin,
    iio_dir: PathBuf,
}

impl PiSensors {
    pub fn new(hw: &HardwareConfig) -> Result<Self> {
        let mut i2c = I2c::new().context("failed to open i2c bus")?;
        i2c.set_slave_address(hw.ads1115_addr)
            .with_context(|| format!("failed to address ads1115 at 0x{:02x}", hw.ads1115_addr))?;

        let rain = Gpio::new()
            .context("failed to open gpio")?
            .get(hw.rain_gpio_pin as u8)
            .with_context(|| format!("failed to claim rain gpio {}", hw.rain_gpio_pin))?
            .into_input_pullup();

        tracing::info!(
            addr = format_args!("0x{:02x}", hw.ads1115_addr),
            channel = hw.moisture_channel,
            rain_gpio = hw.rain_gpio_pin,
            iio = %hw.iio_device_dir,
            "sensors: hardware backend initialised"
        );

        Ok(Self {
            i2c,
            moisture_channel: hw.moisture_channel,
            rain,
            iio_dir: PathBuf::from(&hw.iio_device_dir),
        })
    }

    fn read_iio(&self, attr: &str) -> Result<f32> {
        // The dht11 driver returns EIO on a checksum error; the next read
        // usually succeeds.
        let path = self.iio_dir.join(attr);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        parse_milli(&contents)
    }
}

impl SensorBus for PiSensors {
    fn read_temperature(&mut self) -> Result<f32> {
        self.read_iio(IIO_TEMPERATURE)
    }

    fn read_humidity(&mut self) -> Result<f32> {
        self.read_iio(IIO_HUMIDITY)
    }

    fn read_moisture_raw(&mut self) -> Result<i32> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(self.moisture_channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        // Single-ended reads are non-negative.
        Ok(i32::from(i16::from_be_bytes(buf)).max(0))
    }

    fn read_rain_level(&mut self) -> Result<bool> {
        Ok(self.rain.is_high())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "128 SPS");
    }

    #[test]
    fn parse_milli_temperature() {
        assert_eq!(parse_milli("27300\n").unwrap(), 27.3);
    }

    #[test]
    fn parse_milli_negative() {
        assert_eq!(parse_milli("-1500").unwrap(), -1.5);
    }

    #[test]
    fn parse_milli_garbage() {
        assert!(parse_milli("").is_err());
        assert!(parse_milli("n/a").is_err());
    }
}
