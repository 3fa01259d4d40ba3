// Connection state machine
//
// Disconnected --connect ok--> Connected --settle delay--> scheduler running
// Connected --disconnect / link error--> Disconnected
//
// Every transition in or out of Connected forces all motors to their safe
// default (zero PWM, zero current, switches cleared). The settle delay is a
// one-shot timer tagged with the connection attempt; leaving Connected before
// it fires cancels it, and a late firing for an old attempt is ignored.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::link::{Link, PortEnumerator};
use crate::messages::{
    ConnectionState, ControlEvent, EventSender, LinkFault, MotorSlot, PwmChange, SessionId,
};
use crate::motor::{MOTOR_COUNT, MotorKeys, MotorModel};
use crate::scheduler::CommandScheduler;
use crate::surface::OperatorSurface;
use crate::telemetry::TelemetryParser;

/// Whether the control loop should keep going after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct ConnectionController<L, P, S> {
    link: L,
    enumerator: P,
    surface: S,
    events: EventSender,
    cfg: ControllerConfig,

    state: ConnectionState,
    session: Option<SessionId>,
    attempt: u64,
    settle: Option<JoinHandle<()>>,
    scheduler: CommandScheduler,

    motors: [MotorModel; MOTOR_COUNT],
    parser: TelemetryParser,

    ports: Vec<String>,
    selected: Option<usize>,
}

impl<L: Link, P: PortEnumerator, S: OperatorSurface> ConnectionController<L, P, S> {
    pub fn new(link: L, enumerator: P, surface: S, events: EventSender, cfg: ControllerConfig) -> Self {
        let motors = MotorKeys::defaults().map(|keys| MotorModel::new(keys, cfg.max_pwm));
        let parser = TelemetryParser::new(
            motors
                .iter()
                .flat_map(|m| [m.keys().halted.clone(), m.keys().current.clone()]),
        );

        Self {
            link,
            enumerator,
            surface,
            events,
            scheduler: CommandScheduler::new(cfg.tick_interval),
            cfg,
            state: ConnectionState::Disconnected,
            session: None,
            attempt: 0,
            settle: None,
            motors,
            parser,
            ports: Vec::new(),
            selected: None,
        }
    }

    /// Initial port scan and first paint of the surface
    pub fn start(&mut self) {
        self.scan_ports();
        self.surface.show_connection(false);
        self.publish_motors();
    }

    /// Dispatch one control event
    pub fn handle(&mut self, event: ControlEvent) -> Flow {
        match event {
            ControlEvent::LineReceived { session, line } => {
                if self.is_current(session) {
                    self.on_line(&line);
                } else {
                    debug!("Dropping line from stale session {:?}", session);
                }
            }
            ControlEvent::LinkError { session, fault } => {
                if self.is_current(session) {
                    self.on_link_error(fault);
                } else {
                    debug!("Ignoring fault from stale session {:?}: {}", session, fault.message);
                }
            }
            ControlEvent::TimerTick { generation } => self.on_tick(generation),
            ControlEvent::SettleElapsed { attempt } => self.on_settle(attempt),
            ControlEvent::UserPwmChanged { motor, change } => self.on_pwm(motor, change),
            ControlEvent::EmergencyHalt { motor } => self.on_halt(motor),
            ControlEvent::ConnectRequested => self.connect(),
            ControlEvent::DisconnectRequested => self.disconnect(),
            ControlEvent::ToggleConnection => match self.state {
                ConnectionState::Disconnected => self.connect(),
                ConnectionState::Connected => self.disconnect(),
            },
            ControlEvent::RescanRequested => self.rescan(),
            ControlEvent::SelectNextPort => self.select_next_port(),
            ControlEvent::Quit => {
                self.shutdown();
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    /// Stop everything and close the link. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            self.set_connection_state(ConnectionState::Disconnected);
        }
        self.cancel_settle();
        self.scheduler.stop();
        self.close_link();
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the settle delay has passed and frames are being sent
    pub fn is_commanding(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn motor(&self, slot: MotorSlot) -> Option<&MotorModel> {
        self.motors.get(slot)
    }

    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    pub fn selected_port(&self) -> Option<&str> {
        self.selected.and_then(|i| self.ports.get(i)).map(String::as_str)
    }

    /// Telemetry lines that failed to decode since startup
    pub fn malformed_lines(&self) -> u64 {
        self.parser.malformed_count()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session == Some(session)
    }

    // === Transitions ===

    fn connect(&mut self) {
        if self.state == ConnectionState::Connected {
            debug!("Connect requested while already connected");
            return;
        }
        let Some(port) = self.selected_port().map(str::to_owned) else {
            warn!("Connect requested with no serial port selected");
            self.notify("No serial port selected");
            return;
        };

        match self.link.open(&port) {
            Ok(session) => {
                info!("Connected to {} (session {:?})", port, session);
                self.session = Some(session);
                self.set_connection_state(ConnectionState::Connected);
            }
            Err(e) => {
                warn!("Failed to open {}: {}", port, e);
                self.notify(&format!("Could not open {}: {}", port, e));
            }
        }
    }

    fn disconnect(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Disconnect requested while not connected");
            return;
        }
        info!("Disconnecting");
        self.set_connection_state(ConnectionState::Disconnected);
        self.close_link();
    }

    fn on_link_error(&mut self, fault: LinkFault) {
        warn!("Link error ({:?}): {}, disconnecting", fault.code, fault.message);
        self.set_connection_state(ConnectionState::Disconnected);
        self.close_link();
        self.scan_ports();
        self.notify(&format!("Connection lost: {}", fault.message));
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        self.state = state;

        if state == ConnectionState::Disconnected {
            self.cancel_settle();
            self.scheduler.stop();
        }

        for motor in &mut self.motors {
            motor.set_default_view();
        }
        self.publish_motors();
        self.surface.show_connection(state == ConnectionState::Connected);

        if state == ConnectionState::Connected {
            self.schedule_start();
        }
    }

    fn schedule_start(&mut self) {
        self.cancel_settle();
        self.attempt += 1;
        let attempt = self.attempt;
        let delay = self.cfg.settle_delay;
        let events = self.events.clone();

        debug!("Command frames start in {}ms", delay.as_millis());
        self.settle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ControlEvent::SettleElapsed { attempt });
        }));
    }

    fn cancel_settle(&mut self) {
        if let Some(task) = self.settle.take() {
            task.abort();
        }
    }

    fn on_settle(&mut self, attempt: u64) {
        if attempt != self.attempt || self.state != ConnectionState::Connected {
            debug!("Ignoring settle timer of attempt {}", attempt);
            return;
        }
        self.settle = None;
        self.scheduler.start(&self.events);
    }

    fn close_link(&mut self) {
        self.link.close();
        self.session = None;
    }

    // === Periodic command ===

    fn on_tick(&mut self, generation: u64) {
        if self.state != ConnectionState::Connected || !self.scheduler.accepts(generation) {
            debug!("Dropping stale tick (generation {})", generation);
            return;
        }
        if let Some(line) = CommandScheduler::frame(&self.motors).to_line() {
            self.link.write(&line);
        }
    }

    // === Telemetry ===

    fn on_line(&mut self, line: &[u8]) {
        let record = self.parser.parse(line);

        for (slot, motor) in self.motors.iter_mut().enumerate() {
            if motor.update_data(&record) {
                self.surface.show_motor(slot, &motor.view());
            }
        }

        if record.driver1_error {
            self.notify("Driver 1 experienced an error");
        }
        if record.driver2_error {
            self.notify("Driver 2 experienced an error");
        }
    }

    // === Operator input ===

    fn on_pwm(&mut self, slot: MotorSlot, change: PwmChange) {
        let Some(motor) = self.motors.get_mut(slot) else {
            warn!("PWM change for unknown motor slot {}", slot);
            return;
        };
        motor.set_pwm(change);
        self.surface.show_motor(slot, &motor.view());
    }

    fn on_halt(&mut self, slot: Option<MotorSlot>) {
        match slot {
            Some(slot) => {
                let Some(motor) = self.motors.get_mut(slot) else {
                    warn!("Emergency halt for unknown motor slot {}", slot);
                    return;
                };
                info!("Emergency halt: {}", motor.keys().name);
                motor.emergency_halt();
                self.surface.show_motor(slot, &motor.view());
            }
            None => {
                info!("Emergency halt: all motors");
                for motor in &mut self.motors {
                    motor.emergency_halt();
                }
                self.publish_motors();
            }
        }
    }

    // === Ports ===

    fn rescan(&mut self) {
        if self.state == ConnectionState::Connected {
            debug!("Rescan ignored while connected");
            return;
        }
        self.scan_ports();
    }

    fn scan_ports(&mut self) {
        let previous = self.selected_port().map(str::to_owned);
        self.ports = self.enumerator.available_ports();

        let keep = |name: &Option<String>| {
            name.as_ref()
                .and_then(|n| self.ports.iter().position(|p| p == n))
        };
        self.selected = keep(&previous)
            .or_else(|| keep(&self.cfg.preferred_port))
            .or(if self.ports.is_empty() { None } else { Some(0) });

        info!("{} serial port(s) available", self.ports.len());
        self.surface.show_ports(&self.ports, self.selected);
    }

    fn select_next_port(&mut self) {
        if self.state == ConnectionState::Connected || self.ports.is_empty() {
            return;
        }
        let next = self.selected.map_or(0, |i| (i + 1) % self.ports.len());
        self.selected = Some(next);
        self.surface.show_ports(&self.ports, self.selected);
    }

    // === Surface helpers ===

    fn publish_motors(&mut self) {
        for (slot, motor) in self.motors.iter().enumerate() {
            self.surface.show_motor(slot, &motor.view());
        }
    }

    fn notify(&mut self, message: &str) {
        self.surface.notify(message, self.cfg.status_timeout);
    }
}
