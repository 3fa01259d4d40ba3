// Per-motor state: commanded PWM from the operator, last telemetry from the board

use crate::config::MOTOR_KEYS;
use crate::messages::PwmChange;
use crate::telemetry::TelemetryRecord;

/// Limit switch bits carried by the halted key
const LEFT_LIMIT_BIT: i32 = 0b01;
const RIGHT_LIMIT_BIT: i32 = 0b10;

/// Wire identity of one motor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorKeys {
    pub name: String,
    /// Key in the outbound command frame
    pub frame: String,
    /// Telemetry key holding the limit switch bitmask
    pub halted: String,
    /// Telemetry key holding the current in mA
    pub current: String,
}

impl MotorKeys {
    pub fn new(name: &str, frame: &str, halted: &str, current: &str) -> Self {
        Self {
            name: name.to_string(),
            frame: frame.to_string(),
            halted: halted.to_string(),
            current: current.to_string(),
        }
    }

    /// The three motors of the board, in frame order
    pub fn defaults() -> [MotorKeys; 3] {
        MOTOR_KEYS.map(|(name, frame, halted, current)| Self::new(name, frame, halted, current))
    }
}

/// What the operator surface shows for one motor
#[derive(Debug, Clone, PartialEq)]
pub struct MotorView {
    pub name: String,
    pub pwm: u16,
    pub pwm_percent: f32,
    pub current_ma: u32,
    pub left_limit: bool,
    pub right_limit: bool,
}

#[derive(Debug, Clone)]
pub struct MotorModel {
    keys: MotorKeys,
    max_pwm: u16,
    pwm: u16,
    current_ma: u32,
    left_limit: bool,
    right_limit: bool,
}

impl MotorModel {
    pub fn new(keys: MotorKeys, max_pwm: u16) -> Self {
        Self {
            keys,
            max_pwm: max_pwm.max(1),
            pwm: 0,
            current_ma: 0,
            left_limit: false,
            right_limit: false,
        }
    }

    pub fn keys(&self) -> &MotorKeys {
        &self.keys
    }

    /// Apply the fields of a telemetry record that belong to this motor.
    /// Returns true if anything changed.
    pub fn update_data(&mut self, record: &TelemetryRecord) -> bool {
        let mut changed = false;

        if let Some(bits) = record.get(&self.keys.halted).filter(|b| (0..=3).contains(b)) {
            let left = bits & LEFT_LIMIT_BIT != 0;
            let right = bits & RIGHT_LIMIT_BIT != 0;
            changed |= left != self.left_limit || right != self.right_limit;
            self.left_limit = left;
            self.right_limit = right;
        }

        if let Some(ma) = record.get(&self.keys.current).and_then(|v| u32::try_from(v).ok()) {
            changed |= ma != self.current_ma;
            self.current_ma = ma;
        }

        changed
    }

    /// Commanded PWM, sampled by the command scheduler
    pub fn pwm_value(&self) -> u16 {
        self.pwm
    }

    /// Operator input, clamped to 0..=max_pwm
    pub fn set_pwm(&mut self, change: PwmChange) {
        let target = match change {
            PwmChange::Set(value) => i32::from(value),
            PwmChange::Step(delta) => i32::from(self.pwm).saturating_add(delta),
        };
        // Clamped into u16 range by construction
        self.pwm = target.clamp(0, i32::from(self.max_pwm)) as u16;
    }

    /// Safety state: switches cleared, PWM and current zeroed
    pub fn set_default_view(&mut self) {
        self.left_limit = false;
        self.right_limit = false;
        self.emergency_halt();
    }

    /// Zero PWM and current, leave the limit switches alone
    pub fn emergency_halt(&mut self) {
        self.pwm = 0;
        self.current_ma = 0;
    }

    pub fn view(&self) -> MotorView {
        MotorView {
            name: self.keys.name.clone(),
            pwm: self.pwm,
            pwm_percent: 100.0 * f32::from(self.pwm) / f32::from(self.max_pwm),
            current_ma: self.current_ma,
            left_limit: self.left_limit,
            right_limit: self.right_limit,
        }
    }
}
