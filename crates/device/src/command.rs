//! Inbound command vocabulary shared by the MQTT and serial channels.

use anyhow::{anyhow, bail, Result};
use std::fmt;

/// One decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Force the pump on for the manual override window.
    ManualOn,
    /// `manual-off` or `stop`: enter emergency stop.
    Stop,
    /// Clear an emergency stop (only honoured when re-arm is enabled).
    Rearm,
    /// Advisory irrigation intensity from the decision service. Values
    /// outside 0–2 are kept as received and scheduled as "no pulse".
    Intensity(i64),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManualOn => write!(f, "manual-on"),
            Self::Stop => write!(f, "stop"),
            Self::Rearm => write!(f, "rearm"),
            Self::Intensity(n) => write!(f, "fuzzy-intensity={n}"),
        }
    }
}

/// Parse a command payload (case-insensitive, trims whitespace).
///
/// Accepts `manual-on`, `manual-off`, `stop`, `rearm`,
/// `fuzzy-intensity=<n>` and a bare integer `<n>`, which is how the
/// decision service writes its result on both channels.
pub fn parse(payload: &[u8]) -> Result<Command> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| anyhow!("command payload is not valid utf-8"))?;
    let s = text.trim().to_ascii_lowercase();

    match s.as_str() {
        "manual-on" => return Ok(Command::ManualOn),
        "manual-off" | "stop" => return Ok(Command::Stop),
        "rearm" => return Ok(Command::Rearm),
        "" => bail!("empty command payload"),
        _ => {}
    }

    let value = s
        .strip_prefix("fuzzy-intensity")
        .map(|rest| rest.trim_start())
        .and_then(|rest| rest.strip_prefix('='))
        .unwrap_or(s.as_str())
        .trim();

    value
        .parse::<i64>()
        .map(Command::Intensity)
        .map_err(|_| anyhow!("unknown command '{s}'"))
}

// ===========================================================================
// Tests
// ===========================================================================
