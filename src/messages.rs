// Message types flowing through the control loop and over the wire

use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::mpsc;
use tracing::warn;

/// Identifies one successful link open. Events from an older session are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Index of a motor (0, 1 or 2)
pub type MotorSlot = usize;

/// Outbound composite command, one per scheduler tick.
/// Serialized as a JSON object whose keys keep insertion order, which is the
/// motor slot order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandFrame {
    entries: Vec<(String, u16)>,
}

impl CommandFrame {
    pub fn push(&mut self, key: impl Into<String>, pwm: u16) {
        self.entries.push((key.into(), pwm));
    }

    pub fn get(&self, key: &str) -> Option<u16> {
        self.entries.iter().find(|(k, _)| k == key).map(|&(_, pwm)| pwm)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as one newline-terminated line, or None if encoding fails
    pub fn to_line(&self) -> Option<Vec<u8>> {
        match serde_json::to_vec(self) {
            Ok(mut line) => {
                line.push(b'\n');
                Some(line)
            }
            Err(e) => {
                warn!("Failed to encode command frame: {}", e);
                None
            }
        }
    }
}

impl<K: Into<String>> FromIterator<(K, u16)> for CommandFrame {
    fn from_iter<I: IntoIterator<Item = (K, u16)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, pwm)| (k.into(), pwm)).collect(),
        }
    }
}

impl Serialize for CommandFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, pwm) in &self.entries {
            map.serialize_entry(key, pwm)?;
        }
        map.end()
    }
}

/// Link connection state as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Why a link went down after it was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Device disappeared (unplugged, port closed underneath us)
    ResourceGone,
    ReadFailed,
    WriteFailed,
}

/// Asynchronous link failure, raised once per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFault {
    pub code: FaultCode,
    pub message: String,
}

/// Operator input for a motor's commanded PWM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmChange {
    Set(u16),
    Step(i32),
}

/// Everything the control loop reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    LineReceived { session: SessionId, line: Vec<u8> },
    LinkError { session: SessionId, fault: LinkFault },
    TimerTick { generation: u64 },
    SettleElapsed { attempt: u64 },
    UserPwmChanged { motor: MotorSlot, change: PwmChange },
    /// `None` halts every motor
    EmergencyHalt { motor: Option<MotorSlot> },
    ConnectRequested,
    DisconnectRequested,
    ToggleConnection,
    RescanRequested,
    SelectNextPort,
    Quit,
}

pub type EventSender = mpsc::UnboundedSender<ControlEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ControlEvent>;
