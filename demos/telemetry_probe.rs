// Telemetry probe: READ-ONLY check of the board's serial output
//
// Opens the port, never writes a command frame, and logs every telemetry line
// as decoded for the three motors. Use this first to confirm wiring and baud
// rate before driving any motor.
//
// Usage: cargo run --example telemetry_probe -- <port> [baud]
// Example: cargo run --example telemetry_probe -- /dev/ttyUSB0 9600

use tokio::sync::mpsc;
use tracing::{info, warn};
use trimotor_link::config::DEFAULT_BAUDRATE;
use trimotor_link::link::{Link, SerialLinkSession};
use trimotor_link::messages::ControlEvent;
use trimotor_link::motor::MotorKeys;
use trimotor_link::telemetry::TelemetryParser;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut args = std::env::args().skip(1);
    let Some(port) = args.next() else {
        eprintln!("usage: telemetry_probe <port> [baud]");
        std::process::exit(2);
    };
    let baud = match args.next() {
        Some(b) => b.parse()?,
        None => DEFAULT_BAUDRATE,
    };

    let keys = MotorKeys::defaults();
    let mut parser =
        TelemetryParser::new(keys.iter().flat_map(|k| [k.halted.clone(), k.current.clone()]));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut link = SerialLinkSession::new(baud, tx);
    link.open(&port)?;
    info!("Listening on {} @ {} baud, Ctrl-C to stop", port, baud);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(ControlEvent::LineReceived { line, .. }) => {
                    let record = parser.parse(&line);
                    if record.is_empty() {
                        warn!("Unusable line: {:?}", String::from_utf8_lossy(&line));
                        continue;
                    }
                    for k in &keys {
                        info!(
                            "{}: limit bits={:?} current={:?} mA",
                            k.name,
                            record.get(&k.halted),
                            record.get(&k.current)
                        );
                    }
                    if record.driver1_error || record.driver2_error {
                        warn!(
                            "Driver errors: err1={} err2={}",
                            record.driver1_error, record.driver2_error
                        );
                    }
                }
                Some(ControlEvent::LinkError { fault, .. }) => {
                    warn!("Link lost ({:?}): {}", fault.code, fault.message);
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    link.close();
    info!("{} malformed line(s) seen", parser.malformed_count());
    Ok(())
}
