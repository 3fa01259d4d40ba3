// Single control loop
//
// Everything that can change core state arrives as a ControlEvent on one queue:
// serial lines and faults (link I/O threads), key presses (console thread),
// scheduler ticks and the settle timer (tokio tasks). The loop hands each event
// to the controller in arrival order, so no state is shared across threads.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::info;

use crate::config::{Args, ControllerConfig};
use crate::console::{self, ConsoleSurface, RawModeGuard};
use crate::controller::{ConnectionController, Flow};
use crate::link::{Link, PortEnumerator, SerialLinkSession, SystemPorts};
use crate::messages::{ControlEvent, EventReceiver};
use crate::surface::OperatorSurface;

// Surface redraw period (expires notifications while nothing else happens)
const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

/// Feed events to the controller until Quit or until every sender is gone
pub async fn dispatch<L, P, S>(controller: &mut ConnectionController<L, P, S>, events: &mut EventReceiver)
where
    L: Link,
    P: PortEnumerator,
    S: OperatorSurface,
{
    let mut redraw = interval(REDRAW_INTERVAL);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if controller.handle(event) == Flow::Quit {
                    break;
                }
            }
            _ = redraw.tick() => controller.surface_mut().refresh(),
        }
    }
    controller.shutdown();
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = ControllerConfig::from(&args);
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlEvent>();

    let link = SerialLinkSession::new(args.baud, tx.clone());
    let mut controller = ConnectionController::new(link, SystemPorts, ConsoleSurface::new(), tx.clone(), cfg);

    info!(
        "Runtime started: {}ms command interval, {}ms settle delay, {} baud, max PWM {}",
        args.interval_ms, args.settle_ms, args.baud, args.max_pwm
    );

    let _raw = RawModeGuard::enable()?;
    console::spawn_input(tx.clone(), args.pwm_step)?;

    controller.start();
    if args.connect {
        let _ = tx.send(ControlEvent::ConnectRequested);
    }

    dispatch(&mut controller, &mut rx).await;

    // Leave the status line intact above the shell prompt
    println!("\r");
    info!("Runtime stopped");
    Ok(())
}
