mod actuator;
mod arbiter;
mod command;
mod config;
mod controller;
mod pulse;
mod sensors;
mod telemetry;
mod transport;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Notify;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{Actuator, PumpBoard};
use controller::Controller;
use transport::{Channel, MqttLink, SerialLink};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    info!(
        device_id = %cfg.mqtt.device_id,
        cycle_secs = cfg.control.cycle_secs,
        manual_timeout_secs = cfg.control.manual_timeout_secs,
        "device starting"
    );

    // ── Hardware ────────────────────────────────────────────────────
    // Pump off before anything else.
    let board = PumpBoard::new(&cfg.hardware).context("failed to initialise pump board")?;
    let actuator = Actuator::new(board);
    let sensors = sensors::open(&cfg).context("failed to initialise sensors")?;

    // ── Transports ──────────────────────────────────────────────────
    let inbound = Arc::new(Notify::new());
    let mut channels: Vec<Box<dyn Channel>> = vec![Box::new(MqttLink::start(&cfg.mqtt, inbound.clone()))];
    if let Some(path) = &cfg.serial.path {
        let retry = Duration::from_secs(cfg.mqtt.reconnect_secs);
        channels.push(Box::new(SerialLink::start(path, cfg.serial.baud, retry, inbound.clone())));
    }

    // ── Control loop ────────────────────────────────────────────────
    let mut controller = Controller::new(&cfg, actuator, sensors, channels, Instant::now());
    let mut ticker = interval(cfg.control.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            // Commands are applied right away, not on the next tick.
            _ = inbound.notified() => {}
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("failed to listen for shutdown signal: {e}");
                }
                info!(mode = controller.mode().name(), pump = controller.pump(), "shutting down");
                controller.shutdown();
                break;
            }
        }
        controller.tick(Instant::now());
    }

    // Give the transport tasks a moment to flush the final state change.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
