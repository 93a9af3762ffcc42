//! One pass of the control loop.
//!
//! Every tick runs the same fixed sequence: drain inbound commands from each
//! channel in order, let the arbiter decide the pump state, drive the
//! actuator (announcing real transitions), then publish telemetry if it is
//! due. Nothing here awaits; the caller owns the timing.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actuator::Actuator;
use crate::arbiter::{Arbiter, ControlMode};
use crate::command;
use crate::config::Config;
use crate::sensors::{self, CalibrationRange, SensorBus};
use crate::telemetry::{StateChange, TelemetryTimer};
use crate::transport::Channel;

pub struct Controller {
    arbiter: Arbiter,
    actuator: Actuator,
    sensors: Box<dyn SensorBus>,
    calibration: CalibrationRange,
    channels: Vec<Box<dyn Channel>>,
    telemetry: TelemetryTimer,
}

impl Controller {
    /// `channels` are drained in the given order each tick, so list the
    /// primary transport first.
    pub fn new(
        cfg: &Config,
        actuator: Actuator,
        sensors: Box<dyn SensorBus>,
        channels: Vec<Box<dyn Channel>>,
        start: Instant,
    ) -> Self {
        Self {
            arbiter: Arbiter::new(&cfg.control, start),
            actuator,
            sensors,
            calibration: cfg.calibration.range(),
            channels,
            telemetry: TelemetryTimer::new(start, cfg.control.telemetry_interval()),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.arbiter.mode()
    }

    pub fn pump(&self) -> bool {
        self.actuator.applied()
    }

    pub fn tick(&mut self, now: Instant) {
        self.dispatch_commands(now);

        let pump = self.arbiter.evaluate(now);
        if let Some(change) = self.actuator.apply(pump) {
            self.sensors.observe_pump(change.pump);
            self.broadcast_state(&change);

            let schedule = self.arbiter.scheduler();
            debug!(
                mode = self.arbiter.mode().name(),
                window_open = schedule.window_end().is_some(),
                next_cycle_in_secs = schedule.next_cycle().saturating_duration_since(now).as_secs(),
                "controller: pump transition"
            );
        }

        if self.telemetry.due(now) {
            let sample = sensors::acquire(self.sensors.as_mut(), &self.calibration, self.actuator.applied());
            debug!(
                moisture = sample.soil_moisture_percent,
                raining = sample.raining,
                pump = sample.pump,
                "telemetry: sample"
            );
            for channel in self.channels.iter_mut().filter(|c| c.is_available()) {
                channel.send_telemetry(&sample);
            }
        }
    }

    /// Force the pump off and tell whoever is listening.
    pub fn shutdown(&mut self) {
        if let Some(change) = self.actuator.shutdown() {
            self.sensors.observe_pump(change.pump);
            self.broadcast_state(&change);
        }
    }

    fn dispatch_commands(&mut self, now: Instant) {
        for channel in self.channels.iter_mut() {
            for payload in channel.drain_commands() {
                match command::parse(&payload) {
                    Ok(cmd) => {
                        self.arbiter.handle(cmd, now);
                    }
                    Err(e) => {
                        warn!(channel = channel.name(), "command: ignored: {e:#}");
                    }
                }
            }
        }
    }

    fn broadcast_state(&mut self, change: &StateChange) {
        for channel in self.channels.iter_mut().filter(|c| c.is_available()) {
            channel.send_state(change);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::actuator::PumpBoard;
    use crate::config::HardwareConfig;
    use crate::sensors::tests::FixedBus;
    use crate::sensors::SensorBus;
    use crate::telemetry::TelemetrySample;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        available: bool,
        inbox: Vec<Vec<u8>>,
        states: Vec<StateChange>,
        samples: Vec<TelemetrySample>,
    }

    /// Channel whose inbox and outbox are shared with the test body.
    struct MockChannel(Rc<RefCell<Log>>);

    impl Channel for MockChannel {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn is_available(&self) -> bool {
            self.0.borrow().available
        }

        fn drain_commands(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.0.borrow_mut().inbox)
        }

        fn send_telemetry(&mut self, sample: &TelemetrySample) {
            self.0.borrow_mut().samples.push(sample.clone());
        }

        fn send_state(&mut self, change: &StateChange) {
            self.0.borrow_mut().states.push(*change);
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// Bus handle the test keeps after the controller takes ownership.
    struct SharedBus(Rc<RefCell<FixedBus>>);

    impl SensorBus for SharedBus {
        fn read_temperature(&mut self) -> anyhow::Result<f32> {
            self.0.borrow_mut().read_temperature()
        }

        fn read_humidity(&mut self) -> anyhow::Result<f32> {
            self.0.borrow_mut().read_humidity()
        }

        fn read_moisture_raw(&mut self) -> anyhow::Result<i32> {
            self.0.borrow_mut().read_moisture_raw()
        }

        fn read_rain_level(&mut self) -> anyhow::Result<bool> {
            self.0.borrow_mut().read_rain_level()
        }

        fn observe_pump(&mut self, on: bool) {
            self.0.borrow_mut().observe_pump(on);
        }
    }

    fn controller_with_bus() -> (Controller, Rc<RefCell<Log>>, Rc<RefCell<FixedBus>>, Instant) {
        let log = Rc::new(RefCell::new(Log {
            available: true,
            ..Log::default()
        }));
        let bus = Rc::new(RefCell::new(FixedBus::healthy()));
        let t0 = Instant::now();
        let cfg = Config::default();
        let actuator = Actuator::new(PumpBoard::new(&HardwareConfig::default()).unwrap());
        let c = Controller::new(
            &cfg,
            actuator,
            Box::new(SharedBus(bus.clone())),
            vec![Box::new(MockChannel(log.clone()))],
            t0,
        );
        (c, log, bus, t0)
    }

    fn controller() -> (Controller, Rc<RefCell<Log>>, Instant) {
        let (c, log, _bus, t0) = controller_with_bus();
        (c, log, t0)
    }

    fn send(log: &Rc<RefCell<Log>>, payload: &str) {
        log.borrow_mut().inbox.push(payload.as_bytes().to_vec());
    }

    #[test]
    fn first_tick_publishes_telemetry_with_pump_off() {
        let (mut c, log, t0) = controller();
        c.tick(t0);
        let log = log.borrow();
        assert_eq!(log.samples.len(), 1);
        assert!(!log.samples[0].pump);
        assert_eq!(log.samples[0].soil_moisture_percent, 50);
        assert!(log.states.is_empty());
    }

    #[test]
    fn one_state_change_per_transition() {
        let (mut c, log, t0) = controller();
        send(&log, "2");
        for s in 0..20 {
            c.tick(t0 + secs(s));
        }
        assert_eq!(
            log.borrow().states,
            vec![StateChange { pump: true }, StateChange { pump: false }]
        );
    }

    #[test]
    fn stop_preempts_running_pulse_in_same_tick() {
        let (mut c, log, t0) = controller();
        send(&log, "fuzzy-intensity=2");
        c.tick(t0);
        assert!(c.pump());

        send(&log, "stop");
        c.tick(t0 + Duration::from_millis(300));
        assert!(!c.pump());
        assert_eq!(c.mode(), ControlMode::EmergencyStop);

        // Still off at the next boundary despite intensity 2.
        c.tick(t0 + secs(60));
        assert!(!c.pump());
    }

    #[test]
    fn malformed_command_is_ignored() {
        let (mut c, log, t0) = controller();
        send(&log, "open the floodgates");
        send(&log, "manual-on");
        c.tick(t0);
        assert!(matches!(c.mode(), ControlMode::Manual { .. }));
        assert!(c.pump());
    }

    #[test]
    fn telemetry_reports_applied_pump_state() {
        let (mut c, log, t0) = controller();
        send(&log, "manual-on");
        c.tick(t0);
        assert!(log.borrow().samples[0].pump);
    }

    #[test]
    fn pulse_and_sensing_continue_while_offline() {
        let (mut c, log, bus, t0) = controller_with_bus();
        send(&log, "1");
        c.tick(t0);
        assert!(c.pump());
        assert_eq!(bus.borrow().pump_seen, Some(true));
        assert_eq!(bus.borrow().reads, 1);

        // Offline across two telemetry periods (10 s default).
        log.borrow_mut().available = false;
        for ms in (100..=25_000).step_by(100) {
            c.tick(t0 + Duration::from_millis(ms));
        }
        assert!(!c.pump(), "short pulse closed without the broker");
        assert_eq!(bus.borrow().pump_seen, Some(false));
        assert_eq!(bus.borrow().reads, 3, "sensors still read at 10 s and 20 s");
        {
            let log = log.borrow();
            assert_eq!(log.states, vec![StateChange { pump: true }], "off edge not sent while offline");
            assert_eq!(log.samples.len(), 1, "nothing published while offline");
        }

        // Back online: the next due sample goes out.
        log.borrow_mut().available = true;
        c.tick(t0 + secs(30));
        assert_eq!(bus.borrow().reads, 4);
        let log = log.borrow();
        assert_eq!(log.samples.len(), 2);
        assert!(!log.samples[1].pump);
    }

    #[test]
    fn commands_from_each_channel_are_applied_in_order() {
        let primary = Rc::new(RefCell::new(Log {
            available: true,
            ..Log::default()
        }));
        let fallback = Rc::new(RefCell::new(Log {
            available: true,
            ..Log::default()
        }));
        let t0 = Instant::now();
        let actuator = Actuator::new(PumpBoard::new(&HardwareConfig::default()).unwrap());
        let mut c = Controller::new(
            &Config::default(),
            actuator,
            Box::new(FixedBus::healthy()),
            vec![
                Box::new(MockChannel(primary.clone())),
                Box::new(MockChannel(fallback.clone())),
            ],
            t0,
        );

        send(&primary, "manual-on");
        send(&fallback, "stop");
        c.tick(t0);
        assert_eq!(c.mode(), ControlMode::EmergencyStop);
        assert!(!c.pump());

        // Both channels hear about state changes and telemetry.
        assert_eq!(primary.borrow().samples.len(), 1);
        assert_eq!(fallback.borrow().samples.len(), 1);
    }

    #[test]
    fn shutdown_announces_pump_off() {
        let (mut c, log, t0) = controller();
        send(&log, "manual-on");
        c.tick(t0);
        c.shutdown();
        assert!(!c.pump());
        assert_eq!(
            log.borrow().states,
            vec![StateChange { pump: true }, StateChange { pump: false }]
        );
    }
}
