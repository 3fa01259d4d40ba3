// Serial link to the motor controller board
//
// Provides:
// - Line framing over the raw byte stream
// - Serial session with background reader/writer threads
// - Port enumeration

pub mod framing;
mod ports;
mod session;

pub use framing::LineFramer;
pub use ports::{PortEnumerator, SystemPorts};
pub use session::SerialLinkSession;

use crate::messages::SessionId;

/// Error types for opening a link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Link already open on {port}")]
    AlreadyOpen { port: String },
}

/// Byte link to the board.
///
/// Inbound lines and asynchronous faults are not returned from these calls;
/// implementations push them into the control event queue tagged with the
/// `SessionId` handed out by `open`.
pub trait Link {
    /// Open the named port. On failure nothing changes.
    fn open(&mut self, port: &str) -> Result<SessionId, LinkError>;

    /// Close the current session. Safe to call repeatedly or when never opened.
    fn close(&mut self);

    /// Queue bytes for transmission. Silently ignored when closed.
    fn write(&mut self, bytes: &[u8]);

    fn is_open(&self) -> bool;
}
