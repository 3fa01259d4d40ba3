// Motor state for the three DC motor channels of the controller board
//
// Provides:
// - Wire keys for each motor (command frame key, telemetry keys)
// - Per-motor model: commanded PWM, current, limit switches
// - Display snapshot consumed by the operator surface

mod model;

pub use model::{MotorKeys, MotorModel, MotorView};

/// Number of motor channels on the board
pub const MOTOR_COUNT: usize = 3;
