// Operator-facing display collaborator

use std::time::Duration;

use crate::messages::MotorSlot;
use crate::motor::MotorView;

/// Receives display updates from the connection controller.
/// All calls are fire-and-forget.
pub trait OperatorSurface {
    /// Connection label and rescan affordance (rescan only offered while disconnected)
    fn show_connection(&mut self, connected: bool);

    fn show_ports(&mut self, ports: &[String], selected: Option<usize>);

    fn show_motor(&mut self, slot: MotorSlot, view: &MotorView);

    /// Transient status message that disappears after `timeout`
    fn notify(&mut self, message: &str, timeout: Duration);

    /// Periodic redraw hook so expired notifications go away
    fn refresh(&mut self) {}
}
