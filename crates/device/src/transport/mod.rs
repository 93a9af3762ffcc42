//! Transport layer: best-effort channels that carry commands in and
//! telemetry / state changes out.
//!
//! Each channel runs its I/O in a helper task and hands bytes to the control
//! loop through an mpsc queue. The loop only ever calls the non-blocking
//! [`Channel`] methods, so a dead broker or a stalled tty can never hold up
//! sensor reads, pulse timing or the actuator.

pub mod serial;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::telemetry::{encode, StateChange, TelemetrySample};

pub use serial::SerialLink;

/// Inbound queue depth per channel.
const INBOUND_CAPACITY: usize = 32;

/// Non-blocking view of one transport used by the control loop.
pub trait Channel {
    fn name(&self) -> &'static str;

    /// Whether outbound messages currently have somewhere to go.
    fn is_available(&self) -> bool;

    /// Take every inbound command payload received since the last call, in
    /// arrival order.
    fn drain_commands(&mut self) -> Vec<Vec<u8>>;

    /// Fire-and-forget telemetry publish.
    fn send_telemetry(&mut self, sample: &TelemetrySample);

    /// Fire-and-forget state change publish.
    fn send_state(&mut self, change: &StateChange);
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// What the MQTT event-loop task reports to the control loop.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Command(Vec<u8>),
}

pub struct MqttLink {
    client: AsyncClient,
    events: mpsc::Receiver<TransportEvent>,
    connected: bool,
    telemetry_topic: String,
    state_topic: String,
}

impl MqttLink {
    /// Create the client and spawn its event loop on the current runtime.
    /// Connecting happens in the background; this never waits for the
    /// broker.
    pub fn start(cfg: &MqttConfig, inbound: Arc<Notify>) -> Self {
        let client_id = format!("irrigation-device-{}", cfg.device_id);
        let mut mqttoptions = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        mqttoptions.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        // Commands sent while we are offline are dropped, not replayed.
        mqttoptions.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        info!(
            host = %cfg.host,
            port = cfg.port,
            command_topic = %cfg.command_topic(),
            "mqtt: starting"
        );

        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            cfg.command_topic(),
            tx,
            inbound,
            Duration::from_secs(cfg.reconnect_secs),
        ));

        Self::from_parts(client, rx, cfg)
    }

    fn from_parts(client: AsyncClient, events: mpsc::Receiver<TransportEvent>, cfg: &MqttConfig) -> Self {
        Self {
            client,
            events,
            connected: false,
            telemetry_topic: cfg.telemetry_topic(),
            state_topic: cfg.state_topic(),
        }
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) {
        if !self.connected {
            debug!(topic, "mqtt: offline, publish skipped");
            return;
        }
        if let Err(e) = self.client.try_publish(topic, qos, false, payload) {
            warn!(topic, "mqtt: publish failed: {e}");
        }
    }
}

impl Channel for MqttLink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn is_available(&self) -> bool {
        self.connected
    }

    fn drain_commands(&mut self) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransportEvent::Connected => self.connected = true,
                TransportEvent::Disconnected => self.connected = false,
                TransportEvent::Command(payload) => commands.push(payload),
            }
        }
        commands
    }

    fn send_telemetry(&mut self, sample: &TelemetrySample) {
        if let Some(payload) = encode(sample) {
            self.publish(&self.telemetry_topic, QoS::AtMostOnce, payload);
        }
    }

    fn send_state(&mut self, change: &StateChange) {
        if let Some(payload) = encode(change) {
            self.publish(&self.state_topic, QoS::AtLeastOnce, payload);
        }
    }
}

/// Drive the rumqttc event loop forever. After a connection error the next
/// attempt waits `retry`; every new session re-subscribes to the command
/// topic before anything else.
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    command_topic: String,
    tx: mpsc::Sender<TransportEvent>,
    inbound: Arc<Notify>,
    retry: Duration,
) {
    let mut online = false;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt: connected");
                // Clean sessions lose subscriptions; the request is queued
                // ahead of any publish that could reach us.
                if let Err(e) = client.try_subscribe(&command_topic, QoS::AtMostOnce) {
                    error!(topic = %command_topic, "mqtt: subscribe failed: {e}");
                }
                online = true;
                Some(TransportEvent::Connected)
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                info!(topic = %command_topic, "mqtt: subscribed");
                None
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic == command_topic {
                    Some(TransportEvent::Command(p.payload.to_vec()))
                } else {
                    debug!(topic = %p.topic, "mqtt: unhandled topic");
                    None
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt: broker sent disconnect");
                online = false;
                Some(TransportEvent::Disconnected)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(retry_secs = retry.as_secs(), "mqtt: connection error: {e}");
                let was_online = std::mem::replace(&mut online, false);
                if was_online && tx.send(TransportEvent::Disconnected).await.is_err() {
                    return;
                }
                sleep(retry).await;
                None
            }
        };

        if let Some(event) = event {
            let is_command = matches!(event, TransportEvent::Command(_));
            if tx.send(event).await.is_err() {
                // Control loop is gone.
                return;
            }
            if is_command {
                inbound.notify_one();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
