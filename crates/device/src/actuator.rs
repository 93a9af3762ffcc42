//! Pump relay and status indicators. The `gpio` feature gates the real rppal
//! driver; without it, a mock board logs state changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::HardwareConfig;
use crate::telemetry::StateChange;

// ---------------------------------------------------------------------------
// Real GPIO board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct PumpBoard {
    relay: OutputPin,
    led_on: OutputPin,
    led_off: OutputPin,
    relay_active_low: bool,
}

#[cfg(feature = "gpio")]
impl PumpBoard {
    pub fn new(hw: &HardwareConfig) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let claim = |pin: i64| -> Result<OutputPin> {
            Ok(gpio
                .get(pin as u8)
                .with_context(|| format!("failed to claim gpio {pin}"))?
                .into_output())
        };

        let mut board = Self {
            relay: claim(hw.relay_gpio_pin)?,
            led_on: claim(hw.led_on_gpio_pin)?,
            led_off: claim(hw.led_off_gpio_pin)?,
            relay_active_low: hw.relay_active_low,
        };
        // Fail-safe: pump off before anything else runs.
        board.set(false);
        Ok(board)
    }

    pub fn set(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.relay_active_low {
            self.relay.set_high();
        } else {
            self.relay.set_low();
        }
        if on {
            self.led_on.set_high();
            self.led_off.set_low();
        } else {
            self.led_on.set_low();
            self.led_off.set_high();
        }
    }
}

// ---------------------------------------------------------------------------
// Mock board (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct PumpBoard {
    pub(crate) relay_on: bool,
    pub(crate) led_on: bool,
    pub(crate) led_off: bool,
}

#[cfg(not(feature = "gpio"))]
impl PumpBoard {
    pub fn new(hw: &HardwareConfig) -> Result<Self> {
        info!(
            relay_gpio = hw.relay_gpio_pin,
            led_on_gpio = hw.led_on_gpio_pin,
            led_off_gpio = hw.led_off_gpio_pin,
            "[mock-gpio] pump board initialised (no hardware)"
        );
        Ok(Self {
            relay_on: false,
            led_on: false,
            led_off: true,
        })
    }

    pub fn set(&mut self, on: bool) {
        self.relay_on = on;
        self.led_on = on;
        self.led_off = !on;
    }
}

// ---------------------------------------------------------------------------
// Edge-triggered actuator
// ---------------------------------------------------------------------------

/// Applies the pump command to the board and reports transitions.
pub struct Actuator {
    board: PumpBoard,
    applied: bool,
}

impl Actuator {
    /// The board is already off after construction.
    pub fn new(board: PumpBoard) -> Self {
        Self {
            board,
            applied: false,
        }
    }

    /// Last applied pump state.
    pub fn applied(&self) -> bool {
        self.applied
    }

    /// Drive the outputs to `on`. Returns a state change only when the value
    /// differs from the previously applied one.
    pub fn apply(&mut self, on: bool) -> Option<StateChange> {
        if on == self.applied {
            return None;
        }
        self.board.set(on);
        self.applied = on;
        info!(pump = on, "actuator: pump {}", if on { "ON" } else { "OFF" });
        Some(StateChange { pump: on })
    }

    /// Force everything off on exit.
    pub fn shutdown(&mut self) -> Option<StateChange> {
        let change = self.apply(false);
        // Re-assert even if we believe it is already off.
        self.board.set(false);
        change
    }

    #[cfg(all(test, not(feature = "gpio")))]
    pub(crate) fn board(&self) -> &PumpBoard {
        &self.board
    }
}

// ===========================================================================
// Tests
// ===========================================================================
