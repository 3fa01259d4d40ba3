// Serial port discovery

use tracing::{debug, warn};

/// Source of selectable serial port identifiers
pub trait PortEnumerator {
    /// Currently available ports, in presentation order
    fn available_ports(&mut self) -> Vec<String>;
}

/// Ports reported by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn available_ports(&mut self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => {
                let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
                debug!("Found {} serial port(s): {:?}", names.len(), names);
                names
            }
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }
}
