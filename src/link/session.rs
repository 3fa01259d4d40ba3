// Serial link session
//
// open() spawns two I/O threads for the lifetime of the session:
// - reader: bytes -> LineFramer -> ControlEvent::LineReceived
// - writer: drains queued frames into the port
// Both report failures through a shared latch, so one broken link produces
// exactly one ControlEvent::LinkError no matter how many reads/writes fail.
// close() joins both threads, so the port is released when it returns.

use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::framing::LineFramer;
use super::{Link, LinkError};
use crate::config::{MAX_LINE_LEN, READ_TIMEOUT};
use crate::messages::{ControlEvent, EventSender, FaultCode, LinkFault, SessionId};

/// Reports lines and the first fault of a session into the control queue
#[derive(Clone)]
struct FaultLatch {
    session: SessionId,
    events: EventSender,
    shutdown: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
}

impl FaultLatch {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Returns false once nobody is listening any more
    fn deliver_line(&self, line: Vec<u8>) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.events
            .send(ControlEvent::LineReceived {
                session: self.session,
                line,
            })
            .is_ok()
    }

    fn raise(&self, code: FaultCode, message: String) {
        // A deliberate close is not a fault
        if self.is_shut_down() || self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Serial link fault ({:?}): {}", code, message);
        let _ = self.events.send(ControlEvent::LinkError {
            session: self.session,
            fault: LinkFault { code, message },
        });
    }
}

struct ActiveSession {
    id: SessionId,
    port_name: String,
    writer: std_mpsc::Sender<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
    io_threads: Vec<JoinHandle<()>>,
}

/// Serial port link backed by the `serialport` crate
pub struct SerialLinkSession {
    baudrate: u32,
    events: EventSender,
    next_session: u64,
    active: Option<ActiveSession>,
}

impl SerialLinkSession {
    pub fn new(baudrate: u32, events: EventSender) -> Self {
        Self {
            baudrate,
            events,
            next_session: 0,
            active: None,
        }
    }

    fn spawn_io(
        &self,
        port: Box<dyn SerialPort>,
        latch: FaultLatch,
    ) -> Result<(std_mpsc::Sender<Vec<u8>>, Vec<JoinHandle<()>>), LinkError> {
        let reader_port = port.try_clone()?;
        let reader_latch = latch.clone();
        let reader = thread::Builder::new()
            .name(format!("link-reader-{}", latch.session.0))
            .spawn(move || read_loop(reader_port, reader_latch))?;

        let (tx, rx) = std_mpsc::channel::<Vec<u8>>();
        let writer_latch = latch.clone();
        let spawned = thread::Builder::new()
            .name(format!("link-writer-{}", latch.session.0))
            .spawn(move || write_loop(port, rx, writer_latch));
        match spawned {
            Ok(writer) => Ok((tx, vec![reader, writer])),
            Err(e) => {
                // Reader is already running; stop it
                latch.shutdown.store(true, Ordering::Release);
                join_io(latch.session, vec![reader]);
                Err(e.into())
            }
        }
    }
}

impl Link for SerialLinkSession {
    fn open(&mut self, port_name: &str) -> Result<SessionId, LinkError> {
        if let Some(active) = &self.active {
            return Err(LinkError::AlreadyOpen {
                port: active.port_name.clone(),
            });
        }

        info!("Opening serial link on {} @ {} baud", port_name, self.baudrate);
        let port = serialport::new(port_name, self.baudrate)
            .timeout(READ_TIMEOUT)
            .open()?;

        let id = SessionId(self.next_session + 1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let latch = FaultLatch {
            session: id,
            events: self.events.clone(),
            shutdown: Arc::clone(&shutdown),
            faulted: Arc::new(AtomicBool::new(false)),
        };
        let (writer, io_threads) = self.spawn_io(port, latch)?;

        self.next_session = id.0;
        self.active = Some(ActiveSession {
            id,
            port_name: port_name.to_string(),
            writer,
            shutdown,
            io_threads,
        });
        debug!("Serial session {:?} started", id);
        Ok(id)
    }

    fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.shutdown.store(true, Ordering::Release);
            // Dropping the sender ends the writer thread; the reader notices
            // the flag on its next read timeout. Both hold a handle to the
            // port, which stays locked until they have exited.
            drop(active.writer);
            join_io(active.id, active.io_threads);
            info!("Closed serial link on {} (session {:?})", active.port_name, active.id);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(active) = &self.active else {
            return;
        };
        if active.writer.send(bytes.to_vec()).is_err() {
            debug!("Dropping write, writer for session {:?} has stopped", active.id);
        }
    }

    fn is_open(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for SerialLinkSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn join_io(session: SessionId, threads: Vec<JoinHandle<()>>) {
    for handle in threads {
        if handle.join().is_err() {
            warn!("Link I/O thread for session {:?} panicked", session);
        }
    }
}

fn classify(e: &std::io::Error, fallback: FaultCode) -> FaultCode {
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotFound
        | ErrorKind::PermissionDenied => FaultCode::ResourceGone,
        _ => fallback,
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, latch: FaultLatch) {
    let mut framer = LineFramer::new(MAX_LINE_LEN);
    let mut buf = [0u8; 256];

    while !latch.is_shut_down() {
        match port.read(&mut buf) {
            Ok(0) => {
                latch.raise(FaultCode::ResourceGone, "serial port reached end of stream".into());
                break;
            }
            Ok(n) => {
                framer.extend(&buf[..n]);
                for line in &mut framer {
                    if !latch.deliver_line(line) {
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                latch.raise(classify(&e, FaultCode::ReadFailed), e.to_string());
                break;
            }
        }
    }
    debug!("Reader for session {:?} stopped", latch.session);
}

fn write_loop(mut port: Box<dyn SerialPort>, frames: std_mpsc::Receiver<Vec<u8>>, latch: FaultLatch) {
    for frame in frames {
        if latch.is_shut_down() {
            break;
        }
        if let Err(e) = port.write_all(&frame).and_then(|_| port.flush()) {
            latch.raise(classify(&e, FaultCode::WriteFailed), e.to_string());
            break;
        }
    }
    debug!("Writer for session {:?} stopped", latch.session);
}
