use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use trimotor_link::config::ControllerConfig;
use trimotor_link::controller::{ConnectionController, Flow};
use trimotor_link::link::{Link, LinkError, PortEnumerator};
use trimotor_link::messages::{
    ConnectionState, ControlEvent, EventReceiver, FaultCode, LinkFault, PwmChange, SessionId,
};
use trimotor_link::motor::MotorView;
use trimotor_link::runtime::dispatch;
use trimotor_link::surface::OperatorSurface;

#[derive(Default)]
struct LinkLog {
    opens: Vec<String>,
    writes: Vec<String>,
    closes: usize,
    open: bool,
    fail_next_open: bool,
    last_session: u64,
}

struct MockLink(Rc<RefCell<LinkLog>>);

impl Link for MockLink {
    fn open(&mut self, port: &str) -> Result<SessionId, LinkError> {
        let mut log = self.0.borrow_mut();
        if log.fail_next_open {
            log.fail_next_open = false;
            return Err(LinkError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        log.opens.push(port.to_string());
        log.open = true;
        log.last_session += 1;
        Ok(SessionId(log.last_session))
    }

    fn close(&mut self) {
        let mut log = self.0.borrow_mut();
        if log.open {
            log.closes += 1;
        }
        log.open = false;
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut log = self.0.borrow_mut();
        if log.open {
            log.writes.push(String::from_utf8_lossy(bytes).into_owned());
        }
    }

    fn is_open(&self) -> bool {
        self.0.borrow().open
    }
}

struct MockPorts(Rc<RefCell<Vec<String>>>);

impl PortEnumerator for MockPorts {
    fn available_ports(&mut self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

#[derive(Default)]
struct SurfaceLog {
    connected: Option<bool>,
    ports: Vec<String>,
    selected: Option<usize>,
    motors: [Option<MotorView>; 3],
    notices: Vec<String>,
}

struct RecordingSurface(Rc<RefCell<SurfaceLog>>);

impl OperatorSurface for RecordingSurface {
    fn show_connection(&mut self, connected: bool) {
        self.0.borrow_mut().connected = Some(connected);
    }

    fn show_ports(&mut self, ports: &[String], selected: Option<usize>) {
        let mut log = self.0.borrow_mut();
        log.ports = ports.to_vec();
        log.selected = selected;
    }

    fn show_motor(&mut self, slot: usize, view: &MotorView) {
        self.0.borrow_mut().motors[slot] = Some(view.clone());
    }

    fn notify(&mut self, message: &str, _timeout: Duration) {
        self.0.borrow_mut().notices.push(message.to_string());
    }
}

const SETTLE_MS: u64 = 2000;
const TICK_MS: u64 = 100;

struct Harness {
    ctrl: ConnectionController<MockLink, MockPorts, RecordingSurface>,
    rx: EventReceiver,
    link: Rc<RefCell<LinkLog>>,
    ports: Rc<RefCell<Vec<String>>>,
    surface: Rc<RefCell<SurfaceLog>>,
}

impl Harness {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Rc::new(RefCell::new(LinkLog::default()));
        let ports = Rc::new(RefCell::new(vec![
            "/dev/ttyUSB0".to_string(),
            "/dev/ttyUSB1".to_string(),
        ]));
        let surface = Rc::new(RefCell::new(SurfaceLog::default()));
        let cfg = ControllerConfig {
            tick_interval: Duration::from_millis(TICK_MS),
            settle_delay: Duration::from_millis(SETTLE_MS),
            ..ControllerConfig::default()
        };

        let mut ctrl = ConnectionController::new(
            MockLink(Rc::clone(&link)),
            MockPorts(Rc::clone(&ports)),
            RecordingSurface(Rc::clone(&surface)),
            tx,
            cfg,
        );
        ctrl.start();

        Self {
            ctrl,
            rx,
            link,
            ports,
            surface,
        }
    }

    fn send(&mut self, event: ControlEvent) -> Flow {
        self.ctrl.handle(event)
    }

    /// Let time pass, then handle everything that was queued meanwhile
    async fn advance(&mut self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
        while let Ok(event) = self.rx.try_recv() {
            self.ctrl.handle(event);
        }
    }

    fn session(&self) -> SessionId {
        SessionId(self.link.borrow().last_session)
    }

    fn line(&mut self, text: &str) {
        let session = self.session();
        self.send(ControlEvent::LineReceived {
            session,
            line: text.as_bytes().to_vec(),
        });
    }

    fn set_pwm(&mut self, motor: usize, value: u16) {
        self.send(ControlEvent::UserPwmChanged {
            motor,
            change: PwmChange::Set(value),
        });
    }

    fn writes(&self) -> Vec<String> {
        self.link.borrow().writes.clone()
    }

    fn pwm(&self, motor: usize) -> u16 {
        self.ctrl.motor(motor).unwrap().pwm_value()
    }

    /// Connect and wait until command frames are flowing
    async fn connect_and_settle(&mut self) {
        self.send(ControlEvent::ConnectRequested);
        self.advance(SETTLE_MS + 1).await;
        assert!(self.ctrl.is_commanding());
    }

    fn assert_safe(&self) {
        for slot in 0..3 {
            let view = self.ctrl.motor(slot).unwrap().view();
            assert_eq!(view.pwm, 0, "motor {} pwm", slot);
            assert_eq!(view.current_ma, 0, "motor {} current", slot);
            assert!(!view.left_limit && !view.right_limit);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn connect_resets_motors_and_waits_for_settle() {
    let mut h = Harness::new();
    h.set_pwm(0, 120);

    h.send(ControlEvent::ConnectRequested);
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
    assert_eq!(h.link.borrow().opens, vec!["/dev/ttyUSB0".to_string()]);
    assert_eq!(h.surface.borrow().connected, Some(true));
    h.assert_safe();

    h.advance(SETTLE_MS - 500).await;
    assert!(!h.ctrl.is_commanding());
    assert!(h.writes().is_empty());

    h.advance(501).await;
    assert!(h.ctrl.is_commanding());

    h.set_pwm(0, 10);
    h.advance(TICK_MS + 1).await;
    assert_eq!(h.writes(), vec!["{\"mot1\":10,\"mot2\":0,\"mot3\":0}\n".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn frame_uses_fixed_motor_order() {
    let mut h = Harness::new();
    h.connect_and_settle().await;

    h.set_pwm(2, 33);
    h.set_pwm(0, 11);
    h.set_pwm(1, 22);
    // Ticks one and two; stops short of the third
    h.advance(TICK_MS * 2 + 50).await;

    let writes = h.writes();
    assert_eq!(writes.len(), 2);
    for frame in writes {
        assert_eq!(frame, "{\"mot1\":11,\"mot2\":22,\"mot3\":33}\n");
    }
}

#[tokio::test(start_paused = true)]
async fn pwm_is_clamped_to_max() {
    let mut h = Harness::new();
    h.connect_and_settle().await;

    h.set_pwm(1, 5000);
    h.send(ControlEvent::UserPwmChanged {
        motor: 2,
        change: PwmChange::Step(-20),
    });
    h.advance(TICK_MS + 1).await;
    assert_eq!(h.writes().last().unwrap(), "{\"mot1\":0,\"mot2\":255,\"mot3\":0}\n");
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_settle_never_commands() {
    let mut h = Harness::new();
    h.send(ControlEvent::ConnectRequested);
    h.advance(SETTLE_MS / 2).await;

    h.send(ControlEvent::DisconnectRequested);
    assert_eq!(h.ctrl.state(), ConnectionState::Disconnected);
    h.advance(SETTLE_MS * 3).await;

    assert!(!h.ctrl.is_commanding());
    assert!(h.writes().is_empty());
    assert_eq!(h.link.borrow().closes, 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_zeroes_motors_and_stops_frames() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.set_pwm(0, 100);
    h.set_pwm(1, 50);
    h.line(r#"{"h1":3,"cu1":250}"#);

    h.send(ControlEvent::DisconnectRequested);
    h.assert_safe();
    assert_eq!(h.surface.borrow().connected, Some(false));
    assert!(!h.ctrl.link().is_open());

    let sent = h.writes().len();
    h.advance(TICK_MS * 10).await;
    assert_eq!(h.writes().len(), sent);
}

#[tokio::test(start_paused = true)]
async fn link_error_disconnects_and_refreshes_ports() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.set_pwm(2, 200);

    h.ports.borrow_mut().push("/dev/ttyACM0".to_string());
    let session = h.session();
    h.send(ControlEvent::LinkError {
        session,
        fault: LinkFault {
            code: FaultCode::ResourceGone,
            message: "device unplugged".into(),
        },
    });

    assert_eq!(h.ctrl.state(), ConnectionState::Disconnected);
    assert!(!h.ctrl.is_commanding());
    h.assert_safe();
    assert_eq!(h.ctrl.ports().len(), 3);
    assert_eq!(h.surface.borrow().ports.len(), 3);
    assert_eq!(h.link.borrow().closes, 1);

    let sent = h.writes().len();
    h.advance(SETTLE_MS * 2).await;
    assert_eq!(h.writes().len(), sent);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_keeps_port_list() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.ports.borrow_mut().clear();

    h.send(ControlEvent::DisconnectRequested);
    assert_eq!(h.ctrl.ports().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_requires_fresh_settle() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.send(ControlEvent::DisconnectRequested);
    let sent = h.writes().len();

    h.send(ControlEvent::ToggleConnection);
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
    h.advance(SETTLE_MS - 1).await;
    assert_eq!(h.writes().len(), sent);

    h.advance(TICK_MS + 2).await;
    assert!(h.ctrl.is_commanding());
}

#[tokio::test(start_paused = true)]
async fn telemetry_updates_only_matching_motor() {
    let mut h = Harness::new();
    h.send(ControlEvent::ConnectRequested);

    h.line(r#"{"h1":1,"cu1":200,"h3":2,"cu3":15}"#);
    let m1 = h.ctrl.motor(0).unwrap().view();
    let m2 = h.ctrl.motor(1).unwrap().view();
    let m3 = h.ctrl.motor(2).unwrap().view();
    assert!(m1.left_limit && !m1.right_limit);
    assert_eq!(m1.current_ma, 200);
    assert_eq!(m2.current_ma, 0);
    assert!(m3.right_limit);
    assert_eq!(m3.current_ma, 15);
    assert_eq!(h.surface.borrow().motors[0].as_ref().unwrap().current_ma, 200);
}

#[tokio::test(start_paused = true)]
async fn malformed_telemetry_changes_nothing() {
    let mut h = Harness::new();
    h.send(ControlEvent::ConnectRequested);
    h.line(r#"{"h1":1,"cu1":200}"#);
    let before = h.ctrl.motor(0).unwrap().view();

    h.line(r#"{"h1":0,"cu1":"#);
    h.line("garbage \u{1}\u{2}");
    h.line(r#"{"h1":9,"cu1":-4}"#);

    assert_eq!(h.ctrl.motor(0).unwrap().view(), before);
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
    assert_eq!(h.ctrl.malformed_lines(), 2);
    assert!(h.surface.borrow().notices.is_empty());
}

#[tokio::test(start_paused = true)]
async fn driver_error_flag_notifies_once() {
    let mut h = Harness::new();
    h.connect_and_settle().await;

    h.line(r#"{"err1":1,"err2":0}"#);

    let notices = h.surface.borrow().notices.clone();
    assert_eq!(notices, vec!["Driver 1 experienced an error".to_string()]);
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
    assert!(h.ctrl.is_commanding());
}

#[tokio::test(start_paused = true)]
async fn driver_error_does_not_halt_motors() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.set_pwm(0, 90);

    h.line(r#"{"err1":1,"err2":1}"#);
    assert_eq!(h.pwm(0), 90);
    assert_eq!(h.surface.borrow().notices.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn rescan_only_while_disconnected() {
    let mut h = Harness::new();
    h.ports.borrow_mut().push("/dev/ttyACM0".to_string());
    h.send(ControlEvent::RescanRequested);
    assert_eq!(h.ctrl.ports().len(), 3);

    h.send(ControlEvent::ConnectRequested);
    h.ports.borrow_mut().clear();
    h.send(ControlEvent::RescanRequested);
    assert_eq!(h.ctrl.ports().len(), 3);
    assert_eq!(h.surface.borrow().ports.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rescan_keeps_selected_port() {
    let mut h = Harness::new();
    h.send(ControlEvent::SelectNextPort);
    assert_eq!(h.ctrl.selected_port(), Some("/dev/ttyUSB1"));

    h.ports.borrow_mut().insert(0, "/dev/ttyACM0".to_string());
    h.send(ControlEvent::RescanRequested);
    assert_eq!(h.ctrl.selected_port(), Some("/dev/ttyUSB1"));

    h.ports.borrow_mut().retain(|p| p != "/dev/ttyUSB1");
    h.send(ControlEvent::RescanRequested);
    assert_eq!(h.ctrl.selected_port(), Some("/dev/ttyACM0"));

    h.ports.borrow_mut().clear();
    h.send(ControlEvent::RescanRequested);
    assert_eq!(h.ctrl.selected_port(), None);
    assert_eq!(h.surface.borrow().selected, None);
}

#[tokio::test(start_paused = true)]
async fn open_failure_stays_disconnected() {
    let mut h = Harness::new();
    h.link.borrow_mut().fail_next_open = true;

    h.send(ControlEvent::ConnectRequested);
    assert_eq!(h.ctrl.state(), ConnectionState::Disconnected);
    assert!(h.surface.borrow().notices[0].starts_with("Could not open /dev/ttyUSB0"));

    h.advance(SETTLE_MS * 2).await;
    assert!(!h.ctrl.is_commanding());

    // Operator retries
    h.send(ControlEvent::ConnectRequested);
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_without_ports_is_refused() {
    let mut h = Harness::new();
    h.ports.borrow_mut().clear();
    h.send(ControlEvent::RescanRequested);

    h.send(ControlEvent::ConnectRequested);
    assert_eq!(h.ctrl.state(), ConnectionState::Disconnected);
    assert!(h.link.borrow().opens.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_session_events_ignored() {
    let mut h = Harness::new();
    h.send(ControlEvent::ConnectRequested);
    let old = h.session();
    h.send(ControlEvent::DisconnectRequested);
    h.send(ControlEvent::ConnectRequested);
    assert_ne!(h.session(), old);

    h.send(ControlEvent::LineReceived {
        session: old,
        line: br#"{"cu2":77}"#.to_vec(),
    });
    assert_eq!(h.ctrl.motor(1).unwrap().view().current_ma, 0);

    h.send(ControlEvent::LinkError {
        session: old,
        fault: LinkFault {
            code: FaultCode::ReadFailed,
            message: "old".into(),
        },
    });
    assert_eq!(h.ctrl.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn emergency_halt_single_and_all() {
    let mut h = Harness::new();
    h.connect_and_settle().await;
    h.line(r#"{"h2":1,"cu2":40}"#);
    h.set_pwm(0, 10);
    h.set_pwm(1, 20);
    h.set_pwm(2, 30);

    h.send(ControlEvent::EmergencyHalt { motor: Some(1) });
    assert_eq!((h.pwm(0), h.pwm(1), h.pwm(2)), (10, 0, 30));
    let m2 = h.ctrl.motor(1).unwrap().view();
    assert_eq!(m2.current_ma, 0);
    assert!(m2.left_limit);

    h.send(ControlEvent::EmergencyHalt { motor: None });
    assert_eq!((h.pwm(0), h.pwm(1), h.pwm(2)), (0, 0, 0));

    h.advance(TICK_MS + 1).await;
    assert_eq!(h.writes().last().unwrap(), "{\"mot1\":0,\"mot2\":0,\"mot3\":0}\n");
}

#[tokio::test(start_paused = true)]
async fn quit_is_idempotent() {
    let mut h = Harness::new();
    h.connect_and_settle().await;

    assert_eq!(h.send(ControlEvent::Quit), Flow::Quit);
    h.ctrl.shutdown();
    h.ctrl.shutdown();

    assert_eq!(h.ctrl.state(), ConnectionState::Disconnected);
    assert_eq!(h.link.borrow().closes, 1);
    h.assert_safe();
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_connection_is_safe() {
    let mut h = Harness::new();
    h.ctrl.shutdown();
    h.ctrl.shutdown();
    assert_eq!(h.link.borrow().closes, 0);
}

#[tokio::test(start_paused = true)]
async fn dispatch_runs_until_quit() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let link = Rc::new(RefCell::new(LinkLog::default()));
    let surface = Rc::new(RefCell::new(SurfaceLog::default()));
    let mut ctrl = ConnectionController::new(
        MockLink(Rc::clone(&link)),
        MockPorts(Rc::new(RefCell::new(vec!["/dev/ttyUSB0".to_string()]))),
        RecordingSurface(Rc::clone(&surface)),
        tx.clone(),
        ControllerConfig {
            settle_delay: Duration::from_millis(SETTLE_MS),
            tick_interval: Duration::from_millis(TICK_MS),
            ..ControllerConfig::default()
        },
    );
    ctrl.start();

    tx.send(ControlEvent::ConnectRequested).unwrap();
    tx.send(ControlEvent::UserPwmChanged {
        motor: 0,
        change: PwmChange::Set(42),
    })
    .unwrap();

    let quitter = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(SETTLE_MS + TICK_MS * 2 + 50)).await;
        quitter.send(ControlEvent::Quit).unwrap();
    });

    dispatch(&mut ctrl, &mut rx).await;

    assert_eq!(ctrl.state(), ConnectionState::Disconnected);
    let writes = link.borrow().writes.clone();
    assert_eq!(writes.len(), 2);
    assert!(writes.iter().all(|w| w == "{\"mot1\":42,\"mot2\":0,\"mot3\":0}\n"));
    assert_eq!(surface.borrow().connected, Some(false));
}
