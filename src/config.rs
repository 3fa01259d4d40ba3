// Timing, motor keys, serial defaults and command-line overrides
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

// Command frame interval (scheduler tick)
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

// Pause after opening the link before command traffic starts (board boots on open)
pub const SETTLE_DELAY: Duration = Duration::from_millis(2000);

// How long an operator notification stays visible
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(3000);

// Serial defaults
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

// Longest partial line kept while waiting for a terminator
pub const MAX_LINE_LEN: usize = 1024;

// PWM slider range and keyboard step
pub const MAX_PWM: u16 = 255;
pub const PWM_STEP: u16 = 5;

// Telemetry error flag keys (one per driver chip)
pub const DRIVER1_ERROR_KEY: &str = "err1";
pub const DRIVER2_ERROR_KEY: &str = "err2";

/// Wire keys for one motor: (display name, frame key, halted key, current key)
pub const MOTOR_KEYS: [(&str, &str, &str, &str); 3] = [
    ("Motor 1", "mot1", "h1", "cu1"),
    ("Motor 2", "mot2", "h2", "cu2"),
    ("Motor 3", "mot3", "h3", "cu3"),
];

/// Command-line overrides for the defaults above
#[derive(Debug, Clone, Parser)]
#[command(name = "trimotor-link", version, about = "Control three DC motors over a serial link")]
pub struct Args {
    /// Serial port to preselect (e.g. /dev/ttyUSB0)
    #[arg(long)]
    pub port: Option<String>,

    /// Connect to the selected port at startup
    #[arg(long)]
    pub connect: bool,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    pub baud: u32,

    /// Command frame interval in milliseconds
    #[arg(long, default_value_t = TICK_INTERVAL.as_millis() as u64)]
    pub interval_ms: u64,

    /// Delay between opening the port and the first command frame, in milliseconds
    #[arg(long, default_value_t = SETTLE_DELAY.as_millis() as u64)]
    pub settle_ms: u64,

    /// Maximum PWM value (100% duty)
    #[arg(long, default_value_t = MAX_PWM, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_pwm: u16,

    /// PWM change per key press
    #[arg(long, default_value_t = PWM_STEP)]
    pub pwm_step: u16,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Tunables consumed by the connection controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub tick_interval: Duration,
    pub settle_delay: Duration,
    pub status_timeout: Duration,
    pub max_pwm: u16,
    pub preferred_port: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            settle_delay: SETTLE_DELAY,
            status_timeout: STATUS_TIMEOUT,
            max_pwm: MAX_PWM,
            preferred_port: None,
        }
    }
}

impl From<&Args> for ControllerConfig {
    fn from(args: &Args) -> Self {
        Self {
            // A zero period would panic inside tokio's interval
            tick_interval: Duration::from_millis(args.interval_ms.max(1)),
            settle_delay: Duration::from_millis(args.settle_ms),
            status_timeout: STATUS_TIMEOUT,
            max_pwm: args.max_pwm,
            preferred_port: args.port.clone(),
        }
    }
}

/// Log filter from RUST_LOG-style directives; `info` when none are given
pub fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives)
}
