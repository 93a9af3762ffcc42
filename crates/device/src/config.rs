//! TOML config file loading, environment overrides, and validation for the
//! device controller.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::sensors::CalibrationRange;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub control: ControlConfig,
    pub calibration: CalibrationConfig,
    pub hardware: HardwareConfig,
    pub serial: SerialConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub keep_alive_secs: u64,
    /// Minimum wait between two connection attempts.
    pub reconnect_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub manual_timeout_secs: u64,
    pub cycle_secs: u64,
    pub short_pulse_secs: u64,
    pub long_pulse_secs: u64,
    pub tick_ms: u64,
    pub telemetry_secs: u64,
    /// Intensities older than this are scheduled as 0. Zero disables the check.
    pub intensity_max_age_secs: u64,
    /// Whether a `rearm` command may clear an emergency stop.
    pub allow_rearm: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub raw_dry: i64,
    pub raw_wet: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub ads1115_addr: u16,
    pub moisture_channel: usize,
    pub rain_gpio_pin: i64,
    pub relay_gpio_pin: i64,
    pub led_on_gpio_pin: i64,
    pub led_off_gpio_pin: i64,
    /// Many common relay boards are active-low.
    pub relay_active_low: bool,
    /// IIO directory exposed by the kernel dht11 driver.
    pub iio_device_dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Line-oriented tty or FIFO used as the local fallback channel.
    pub path: Option<String>,
    /// Line speed for a tty; ignored for a FIFO.
    pub baud: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            device_id: "esp-01".to_string(),
            keep_alive_secs: 30,
            reconnect_secs: 5,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            manual_timeout_secs: 30,
            cycle_secs: 60,
            short_pulse_secs: 5,
            long_pulse_secs: 15,
            tick_ms: 100,
            telemetry_secs: 10,
            intensity_max_age_secs: 600,
            allow_rearm: false,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        // Capacitive probe on a 3.3 V ADS1115 input.
        Self {
            raw_dry: 26000,
            raw_wet: 12000,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud: 115_200,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            ads1115_addr: 0x48,
            moisture_channel: 0,
            rain_gpio_pin: 22,
            relay_gpio_pin: 17,
            led_on_gpio_pin: 23,
            led_off_gpio_pin: 24,
            relay_active_low: true,
            iio_device_dir: "/sys/bus/iio/devices/iio:device0".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl ControlConfig {
    pub fn manual_timeout(&self) -> Duration {
        Duration::from_secs(self.manual_timeout_secs)
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_secs(self.cycle_secs)
    }

    pub fn short_pulse(&self) -> Duration {
        Duration::from_secs(self.short_pulse_secs)
    }

    pub fn long_pulse(&self) -> Duration {
        Duration::from_secs(self.long_pulse_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_secs)
    }

    pub fn intensity_max_age(&self) -> Option<Duration> {
        (self.intensity_max_age_secs > 0).then(|| Duration::from_secs(self.intensity_max_age_secs))
    }
}

impl MqttConfig {
    pub fn command_topic(&self) -> String {
        format!("device/{}/command", self.device_id)
    }

    pub fn telemetry_topic(&self) -> String {
        format!("device/{}/telemetry", self.device_id)
    }

    pub fn state_topic(&self) -> String {
        format!("device/{}/state", self.device_id)
    }
}

impl CalibrationConfig {
    pub fn range(&self) -> CalibrationRange {
        CalibrationRange::new(self.raw_dry as i32, self.raw_wet as i32)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Upper bound for every control duration. Keeps deadline arithmetic on
/// the monotonic clock far from overflow.
const MAX_CONTROL_SECS: u64 = 7 * 24 * 3600;

/// Longest loop tick.
const MAX_TICK_MS: u64 = 60_000;

/// MQTT encodes keep-alive as a 16-bit number of seconds.
const MAX_KEEP_ALIVE_SECS: u64 = u16::MAX as u64;

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

/// Highest single-ended ADS1115 input (AIN3).
const ADS1115_MAX_CHANNEL: usize = 3;

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_control(&mut errors);
        self.validate_calibration(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_serial(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if m.device_id.trim().is_empty() {
            errors.push("mqtt: device_id is empty".to_string());
        } else if m.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "mqtt: device_id '{}' must not contain '/', '+' or '#'",
                m.device_id
            ));
        }
        if m.reconnect_secs == 0 || m.reconnect_secs > MAX_CONTROL_SECS {
            errors.push(format!(
                "mqtt: reconnect_secs ({}) must be between 1 and {MAX_CONTROL_SECS}",
                m.reconnect_secs
            ));
        }
        if m.keep_alive_secs > MAX_KEEP_ALIVE_SECS {
            errors.push(format!(
                "mqtt: keep_alive_secs ({}) must be at most {MAX_KEEP_ALIVE_SECS}",
                m.keep_alive_secs
            ));
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;

        // ── Timing values (positive and bounded) ────────────
        for (name, value, max) in [
            ("manual_timeout_secs", c.manual_timeout_secs, MAX_CONTROL_SECS),
            ("cycle_secs", c.cycle_secs, MAX_CONTROL_SECS),
            ("short_pulse_secs", c.short_pulse_secs, MAX_CONTROL_SECS),
            ("long_pulse_secs", c.long_pulse_secs, MAX_CONTROL_SECS),
            ("tick_ms", c.tick_ms, MAX_TICK_MS),
            ("telemetry_secs", c.telemetry_secs, MAX_CONTROL_SECS),
        ] {
            if value == 0 {
                errors.push(format!("control: {name} must be positive"));
            } else if value > max {
                errors.push(format!("control: {name} ({value}) must be at most {max}"));
            }
        }
        if c.intensity_max_age_secs > MAX_CONTROL_SECS {
            errors.push(format!(
                "control: intensity_max_age_secs ({}) must be at most {MAX_CONTROL_SECS}",
                c.intensity_max_age_secs
            ));
        }

        // ── Pulse ordering ──────────────────────────────────
        if c.long_pulse_secs <= c.short_pulse_secs {
            errors.push(format!(
                "control: long_pulse_secs ({}) must be greater than short_pulse_secs ({})",
                c.long_pulse_secs, c.short_pulse_secs
            ));
        }
        if c.cycle_secs > 0 && c.long_pulse_secs >= c.cycle_secs {
            errors.push(format!(
                "control: long_pulse_secs ({}) must be shorter than cycle_secs ({})",
                c.long_pulse_secs, c.cycle_secs
            ));
        }
    }

    fn validate_calibration(&self, errors: &mut Vec<String>) {
        let cal = &self.calibration;
        if cal.raw_dry < 0 || cal.raw_dry > ADS1115_MAX {
            errors.push(format!(
                "calibration: raw_dry {} out of ADS1115 range [0, {ADS1115_MAX}]",
                cal.raw_dry
            ));
        }
        if cal.raw_wet < 0 || cal.raw_wet > ADS1115_MAX {
            errors.push(format!(
                "calibration: raw_wet {} out of ADS1115 range [0, {ADS1115_MAX}]",
                cal.raw_wet
            ));
        }
        if cal.raw_dry == cal.raw_wet {
            errors.push(format!(
                "calibration: raw_dry and raw_wet are both {}: calibration range is zero",
                cal.raw_dry
            ));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;

        if hw.moisture_channel > ADS1115_MAX_CHANNEL {
            errors.push(format!(
                "hardware: moisture_channel {} out of range (0–{ADS1115_MAX_CHANNEL})",
                hw.moisture_channel
            ));
        }

        // ── GPIO pin whitelist ──────────────────────────────
        let mut seen_pins: HashSet<i64> = HashSet::new();
        for (name, pin) in [
            ("rain_gpio_pin", hw.rain_gpio_pin),
            ("relay_gpio_pin", hw.relay_gpio_pin),
            ("led_on_gpio_pin", hw.led_on_gpio_pin),
            ("led_off_gpio_pin", hw.led_off_gpio_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware: {name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "hardware: {name} {pin} is already used by another output"
                ));
            }
        }
    }

    fn validate_serial(&self, errors: &mut Vec<String>) {
        let serial = &self.serial;
        if let Some(path) = &serial.path {
            if path.trim().is_empty() {
                errors.push("serial: path is empty".to_string());
            }
            if serial.baud == 0 {
                errors.push("serial: baud must be positive".to_string());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Environment overrides
    // -----------------------------------------------------------------------

    /// Apply `MQTT_HOST`, `MQTT_PORT` and `DEVICE_ID` overrides. `lookup` is
    /// `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(id) = lookup("DEVICE_ID") {
            self.mqtt.device_id = id;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, falling back to defaults when the
/// file does not exist, then apply env overrides and validate.
pub fn load(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found: using defaults");
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok());

    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.control.manual_timeout_secs, 30);
        assert_eq!(config.control.cycle_secs, 60);
        assert!(!config.control.allow_rearm);
        assert!(config.serial.path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[mqtt]
host = "broker.local"
device_id = "garden-1"

[control]
short_pulse_secs = 8
long_pulse_secs = 20
allow_rearm = true

[calibration]
raw_dry = 3000
raw_wet = 1200

[serial]
path = "/dev/ttyUSB0"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883, "unset keys keep defaults");
        assert_eq!(config.control.long_pulse(), Duration::from_secs(20));
        assert!(config.control.allow_rearm);
        assert_eq!(config.calibration.raw_dry, 3000);
        assert_eq!(config.serial.path.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.serial.baud, 115_200);
        config.validate().unwrap();
    }

    #[test]
    fn huge_manual_timeout_rejected() {
        let config: Config = toml::from_str(
            "[control]\nmanual_timeout_secs = 9223372036854775807\n",
        )
        .unwrap();
        assert_validation_err(&config, "manual_timeout_secs");
    }

    #[test]
    fn timing_upper_bounds_rejected() {
        let mut cfg = Config::default();
        cfg.control.cycle_secs = MAX_CONTROL_SECS + 1;
        cfg.control.tick_ms = MAX_TICK_MS + 1;
        cfg.control.intensity_max_age_secs = u64::MAX;
        cfg.mqtt.keep_alive_secs = 70_000;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("cycle_secs"), "{msg}");
        assert!(msg.contains("tick_ms"), "{msg}");
        assert!(msg.contains("intensity_max_age_secs"), "{msg}");
        assert!(msg.contains("keep_alive_secs"), "{msg}");
    }

    #[test]
    fn serial_baud_must_be_positive() {
        let mut cfg = Config::default();
        cfg.serial.path = Some("/dev/ttyAMA0".into());
        cfg.serial.baud = 0;
        assert_validation_err(&cfg, "baud");
    }

    #[test]
    fn topics_include_device_id() {
        let mut cfg = Config::default();
        cfg.mqtt.device_id = "plot-7".into();
        assert_eq!(cfg.mqtt.command_topic(), "device/plot-7/command");
        assert_eq!(cfg.mqtt.telemetry_topic(), "device/plot-7/telemetry");
        assert_eq!(cfg.mqtt.state_topic(), "device/plot-7/state");
    }

    #[test]
    fn intensity_max_age_zero_disables() {
        let mut cfg = Config::default();
        assert_eq!(cfg.control.intensity_max_age(), Some(Duration::from_secs(600)));
        cfg.control.intensity_max_age_secs = 0;
        assert_eq!(cfg.control.intensity_max_age(), None);
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_mqtt_settings() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "8883"),
            ("DEVICE_ID", "esp-02"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.device_id, "esp-02");
    }

    #[test]
    fn env_bad_port_is_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| (k == "MQTT_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.mqtt.port, 1883);
    }

    // -- Validation: mqtt -------------------------------------------------

    #[test]
    fn device_id_with_wildcard_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.device_id = "dev/+".into();
        assert_validation_err(&cfg, "must not contain");
    }

    #[test]
    fn empty_host_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = " ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    #[test]
    fn zero_reconnect_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.reconnect_secs = 0;
        assert_validation_err(&cfg, "reconnect_secs (0) must be between 1");
    }

    // -- Validation: control ----------------------------------------------

    #[test]
    fn zero_manual_timeout_rejected() {
        let mut cfg = Config::default();
        cfg.control.manual_timeout_secs = 0;
        assert_validation_err(&cfg, "manual_timeout_secs must be positive");
    }

    #[test]
    fn long_pulse_must_exceed_short() {
        let mut cfg = Config::default();
        cfg.control.short_pulse_secs = 10;
        cfg.control.long_pulse_secs = 10;
        assert_validation_err(
            &cfg,
            "long_pulse_secs (10) must be greater than short_pulse_secs (10)",
        );
    }

    #[test]
    fn long_pulse_must_fit_in_cycle() {
        let mut cfg = Config::default();
        cfg.control.cycle_secs = 20;
        cfg.control.long_pulse_secs = 20;
        assert_validation_err(&cfg, "must be shorter than cycle_secs (20)");
    }

    // -- Validation: calibration ------------------------------------------

    #[test]
    fn calibration_zero_range_rejected() {
        let mut cfg = Config::default();
        cfg.calibration.raw_dry = 15000;
        cfg.calibration.raw_wet = 15000;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn calibration_out_of_adc_range_rejected() {
        let mut cfg = Config::default();
        cfg.calibration.raw_wet = 40000;
        assert_validation_err(&cfg, "raw_wet 40000 out of ADS1115 range");
    }

    #[test]
    fn calibration_inverted_orientation_accepted() {
        let mut cfg = Config::default();
        cfg.calibration.raw_dry = 1000;
        cfg.calibration.raw_wet = 3000;
        cfg.validate().unwrap();
    }

    // -- Validation: hardware ---------------------------------------------

    #[test]
    fn gpio_pin_1_rejected() {
        let mut cfg = Config::default();
        cfg.hardware.relay_gpio_pin = 1;
        assert_validation_err(&cfg, "relay_gpio_pin 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_gpio_rejected() {
        let mut cfg = Config::default();
        cfg.hardware.led_on_gpio_pin = cfg.hardware.relay_gpio_pin;
        assert_validation_err(&cfg, "already used by another output");
    }

    #[test]
    fn moisture_channel_out_of_range() {
        let mut cfg = Config::default();
        cfg.hardware.moisture_channel = 4;
        assert_validation_err(&cfg, "moisture_channel 4 out of range");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.device_id = "".into();
        cfg.control.cycle_secs = 0;
        cfg.calibration.raw_dry = -1;
        cfg.hardware.rain_gpio_pin = 0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("device_id is empty"), "missing id error in: {msg}");
        assert!(msg.contains("cycle_secs must be positive"), "missing cycle error in: {msg}");
        assert!(msg.contains("raw_dry -1"), "missing calibration error in: {msg}");
        assert!(msg.contains("rain_gpio_pin 0"), "missing gpio error in: {msg}");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = load("/nonexistent/irrigation-device.toml").unwrap();
        assert_eq!(cfg.control.telemetry_secs, 10);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "irrigation-device-invalid-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[control]\nshort_pulse_secs = 30\nlong_pulse_secs = 10\n").unwrap();

        let err = load(path.to_str().unwrap()).unwrap_err();
        let msg = format!("{err:#}");
        std::fs::remove_file(&path).ok();

        assert!(msg.contains("invalid config"), "got: {msg}");
        assert!(msg.contains("long_pulse_secs (10)"), "got: {msg}");
    }
}
