// Terminal operator console
//
// Keys:
//   q/a  w/s  e/d   raise/lower motor 1/2/3
//   1 2 3           emergency halt motor 1/2/3
//   space           halt all motors
//   n               connect / disconnect
//   p               next serial port
//   r               rescan serial ports
//   Esc, Ctrl-C     quit

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    style::Print,
    terminal::{self, ClearType},
};
use std::io::{self, Stdout, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::messages::{ControlEvent, EventSender, MotorSlot, PwmChange};
use crate::motor::{MOTOR_COUNT, MotorView};
use crate::surface::OperatorSurface;

const INPUT_POLL: Duration = Duration::from_millis(100);

/// Keys raising / lowering each motor, in slot order
const PWM_KEYS: [(char, char); MOTOR_COUNT] = [('q', 'a'), ('w', 's'), ('e', 'd')];

/// Translate a key press into a control event
pub fn map_key(key: KeyEvent, pwm_step: u16) -> Option<ControlEvent> {
    if key.kind == KeyEventKind::Release {
        return None;
    }

    let step = i32::from(pwm_step);
    match key.code {
        KeyCode::Esc => Some(ControlEvent::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(ControlEvent::Quit)
        }
        KeyCode::Char(c) => {
            let c = c.to_ascii_lowercase();
            if let Some(motor) = PWM_KEYS.iter().position(|&(up, _)| up == c) {
                return Some(ControlEvent::UserPwmChanged {
                    motor,
                    change: PwmChange::Step(step),
                });
            }
            if let Some(motor) = PWM_KEYS.iter().position(|&(_, down)| down == c) {
                return Some(ControlEvent::UserPwmChanged {
                    motor,
                    change: PwmChange::Step(-step),
                });
            }
            match c {
                '1'..='3' => Some(ControlEvent::EmergencyHalt {
                    motor: Some(c as usize - '1' as usize),
                }),
                ' ' => Some(ControlEvent::EmergencyHalt { motor: None }),
                'n' => Some(ControlEvent::ToggleConnection),
                'p' => Some(ControlEvent::SelectNextPort),
                'r' => Some(ControlEvent::RescanRequested),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Read keys on a dedicated thread and feed them into the control queue
pub fn spawn_input(events: EventSender, pwm_step: u16) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console-input".into())
        .spawn(move || input_loop(events, pwm_step))
}

fn input_loop(events: EventSender, pwm_step: u16) {
    loop {
        match event::poll(INPUT_POLL) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => {
                    let Some(ev) = map_key(key, pwm_step) else {
                        continue;
                    };
                    let quit = ev == ControlEvent::Quit;
                    if events.send(ev).is_err() || quit {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Console input failed: {}", e);
                    let _ = events.send(ControlEvent::Quit);
                    return;
                }
            },
            Ok(false) => {
                if events.is_closed() {
                    return;
                }
            }
            Err(e) => {
                warn!("Console input failed: {}", e);
                let _ = events.send(ControlEvent::Quit);
                return;
            }
        }
    }
}

/// Puts the terminal in raw mode for single-key input; restores it on drop
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to restore terminal: {}", e);
        }
    }
}

/// One-line status panel redrawn in place
pub struct ConsoleSurface {
    out: Stdout,
    connected: bool,
    port: Option<String>,
    port_count: usize,
    motors: [Option<MotorView>; MOTOR_COUNT],
    notice: Option<(String, Instant)>,
}

impl ConsoleSurface {
    pub fn new() -> Self {
        Self {
            out: io::stdout(),
            connected: false,
            port: None,
            port_count: 0,
            motors: [None, None, None],
            notice: None,
        }
    }

    fn status_line(&self) -> String {
        let mut line = if self.connected {
            format!("[n] Disconnect {}", self.port.as_deref().unwrap_or("?"))
        } else {
            format!(
                "[n] Connect {} ({} port(s), [p] next, [r] rescan)",
                self.port.as_deref().unwrap_or("<no port>"),
                self.port_count
            )
        };

        for view in self.motors.iter().flatten() {
            line.push_str(&format!(
                " | {} PWM: {:.0}% Current: {} mA [{}{}]",
                view.name,
                view.pwm_percent,
                view.current_ma,
                if view.left_limit { 'L' } else { '-' },
                if view.right_limit { 'R' } else { '-' },
            ));
        }

        if let Some((message, _)) = &self.notice {
            line.push_str(" | ");
            line.push_str(message);
        }
        line
    }

    fn render(&mut self) {
        if self.notice.as_ref().is_some_and(|(_, until)| Instant::now() >= *until) {
            self.notice = None;
        }
        let line = self.status_line();
        let drawn = queue!(
            self.out,
            cursor::MoveToColumn(0),
            terminal::Clear(ClearType::CurrentLine),
            Print(line)
        )
        .and_then(|_| self.out.flush());
        if let Err(e) = drawn {
            debug!("Console redraw failed: {}", e);
        }
    }
}

impl Default for ConsoleSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorSurface for ConsoleSurface {
    fn show_connection(&mut self, connected: bool) {
        self.connected = connected;
        self.render();
    }

    fn show_ports(&mut self, ports: &[String], selected: Option<usize>) {
        self.port = selected.and_then(|i| ports.get(i)).cloned();
        self.port_count = ports.len();
        self.render();
    }

    fn show_motor(&mut self, slot: MotorSlot, view: &MotorView) {
        if let Some(entry) = self.motors.get_mut(slot) {
            *entry = Some(view.clone());
        }
        self.render();
    }

    fn notify(&mut self, message: &str, timeout: Duration) {
        self.notice = Some((message.to_string(), Instant::now() + timeout));
        self.render();
    }

    fn refresh(&mut self) {
        if self.notice.is_some() {
            self.render();
        }
    }
}
